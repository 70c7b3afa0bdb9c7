//! Scripted executor for tests.
//!
//! Each rule matches calls whose argument list contains every token of the
//! rule, in order. Responses are consumed front to back; the last response
//! repeats for every further matching call.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandExecutor, RawOutput};

struct Rule {
    tokens: Vec<String>,
    responses: VecDeque<RawOutput>,
}

impl Rule {
    fn matches(&self, program: &str, args: &[String]) -> bool {
        let mut haystack = std::iter::once(program).chain(args.iter().map(String::as_str));
        self.tokens
            .iter()
            .all(|token| haystack.any(|arg| arg == token))
    }

    fn next(&mut self) -> RawOutput {
        if self.responses.len() > 1 {
            self.responses.pop_front().unwrap_or_else(no_response)
        } else {
            self.responses.front().cloned().unwrap_or_else(no_response)
        }
    }
}

fn no_response() -> RawOutput {
    RawOutput::failure(127, "error: no scripted response")
}

/// A recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub program: String,
    pub args: Vec<String>,
}

impl Call {
    /// True when every token appears in the argument list, in order.
    pub fn contains(&self, tokens: &[&str]) -> bool {
        let mut args = self.args.iter();
        tokens.iter().all(|token| args.any(|arg| arg == token))
    }
}

/// In-memory executor answering from preset responses.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register responses for calls containing `tokens`. Earlier rules win.
    #[must_use]
    pub fn on<I>(self, tokens: &[&str], responses: I) -> Self
    where
        I: IntoIterator<Item = RawOutput>,
    {
        let rule = Rule {
            tokens: tokens.iter().map(|t| (*t).to_string()).collect(),
            responses: responses.into_iter().collect(),
        };
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(rule);
        }
        self
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Calls whose arguments contain `tokens` in order.
    pub fn calls_matching(&self, tokens: &[&str]) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.contains(tokens))
            .collect()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn invoke(&self, program: &str, args: &[String]) -> std::io::Result<RawOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call {
                program: program.to_string(),
                args: args.to_vec(),
            });
        }

        let mut rules = self
            .rules
            .lock()
            .map_err(|_| std::io::Error::other("scripted executor poisoned"))?;
        Ok(rules
            .iter_mut()
            .find(|rule| rule.matches(program, args))
            .map_or_else(no_response, Rule::next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::exec::Operation;

    #[tokio::test]
    async fn test_responses_consumed_then_last_repeats() {
        let exec = ScriptedExecutor::new().on(
            &["get", "nodes"],
            [
                RawOutput::failure(1, "connection refused"),
                RawOutput::success("ok"),
            ],
        );
        let op = Operation::oc(["get", "nodes", "-o", "json"]);

        assert!(exec.execute(&op).await.unwrap_err().is_transient());
        assert_eq!(exec.execute(&op).await.unwrap(), "ok");
        assert_eq!(exec.execute(&op).await.unwrap(), "ok");
        assert_eq!(exec.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let exec = ScriptedExecutor::new()
            .on(&["get", "co", "network"], [RawOutput::success("network")])
            .on(&["get", "co"], [RawOutput::success("all")]);

        let specific = Operation::oc(["get", "co", "network", "-o", "json"]);
        let general = Operation::oc(["get", "co", "-o", "json"]);
        assert_eq!(exec.execute(&specific).await.unwrap(), "network");
        assert_eq!(exec.execute(&general).await.unwrap(), "all");
    }

    #[tokio::test]
    async fn test_unmatched_call_is_fatal() {
        let exec = ScriptedExecutor::new();
        let err = exec.execute(&Operation::oc(["whoami"])).await.unwrap_err();
        assert!(matches!(err, FailureKind::Fatal(_)));
    }

    #[tokio::test]
    async fn test_calls_matching_filters_in_order() {
        let exec = ScriptedExecutor::new().on(&["rsh"], [RawOutput::success("")]);
        exec.execute(&Operation::oc(["rsh", "-n", "ns", "pod-a", "shutdown"]))
            .await
            .unwrap();
        exec.execute(&Operation::oc(["rsh", "-n", "ns", "pod-b", "shutdown"]))
            .await
            .unwrap();

        assert_eq!(exec.calls_matching(&["rsh", "pod-b"]).len(), 1);
        assert_eq!(exec.calls_matching(&["pod-b", "rsh"]).len(), 0);
    }
}
