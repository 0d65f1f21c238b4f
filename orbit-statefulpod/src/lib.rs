//! Kubernetes operator for StatefulPod workloads: ordered replicas, each with
//! its own storage claim, behind an optional discovery endpoint.
//!
//! The [`Reconciler`] holds the convergence logic and talks to the cluster only
//! through a [`store::ResourceStore`]. The [`dispatcher::Dispatcher`] runs it
//! under a kube controller, with the workload finalizer splitting passes into
//! apply and cleanup.

pub mod config;
pub mod controllers;
pub mod crd;
pub mod dispatcher;
pub mod error;
pub mod reconciler;
pub mod status;
pub mod store;

pub use error::{Error, Result};
pub use reconciler::{Outcome, Reconciler};
