//! Core library for `sealward`.
//!
//! Bootstraps and reconciles a Vault cluster running on Kubernetes: finds the
//! Vault pods and their leader, tunnels into them, drives the init/unseal
//! lifecycle, persists the resulting credentials per environment, and
//! idempotently ensures auth methods, secrets engines, policies, and roles
//! exist. Every stage is safe to re-run against a partially bootstrapped
//! cluster.
//!
//! External systems sit behind traits so the orchestration can be exercised
//! without a cluster:
//!
//! - [`cluster::ClusterApi`] — the Kubernetes API (pods, config maps, services)
//! - [`tunnel::PodDialer`] — byte streams into a pod port
//! - [`vault::VaultApi`] / [`vault::VaultConnector`] — the Vault HTTP API
//! - [`sink::TokenSink`] — where the root token is forwarded after init

pub mod autounseal;
pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod environment;
pub mod error;
pub mod pipeline;
pub mod plans;
pub mod pods;
pub mod reconcile;
pub mod sink;
pub mod tunnel;
pub mod unseal;
pub mod vault;

#[cfg(test)]
mod testing;
