//! netmig - convergence-driven OpenShift network plugin migration.
//!
//! Moves a running cluster between OpenShift SDN and OVN-Kubernetes by
//! chaining idempotent mutations with convergence waits:
//! - `exec`, `retry` and `poll` run and re-run `oc` calls and wait on state
//! - `step`, `reboot` and `sequencer` turn those into ordered protocol stages
//! - `cluster` and `protocol` hold the OpenShift specifics

pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod poll;
pub mod protocol;
pub mod reboot;
pub mod report;
pub mod retry;
pub mod sequencer;
pub mod step;
