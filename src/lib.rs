//! Lifecycle controller that gates workload deployments on check tasks.
//!
//! A [`reconciler::Reconciler`] drives each `WorkloadInstance` through its
//! pre-deployment and post-deployment checks, one idempotent pass at a time.
//! A [`controller::Controller`] schedules those passes.

pub mod config;
pub mod context;
pub mod controller;
pub mod errors;
pub mod events;
pub mod logging;
pub mod naming;
pub mod phase;
pub mod reconciler;
pub mod resources;
pub mod store;
