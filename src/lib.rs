//! jupyter-operator - Kubernetes operator for Jupyter Notebook instances
//!
//! The operator watches Notebook custom resources and converges the
//! cluster onto the state they declare: for every Notebook it maintains a
//! Service, a Secret holding credentials and TLS material, a StatefulSet
//! running the notebook server, and optionally an Ingress.
//!
//! # Modules
//!
//! - [`crd`] - The Notebook Custom Resource Definition
//! - [`controller`] - Reconciliation engine: informers, work queue,
//!   dispatcher, per-resource reconcilers, and the sync loop
//! - [`resources`] - Pure builders for dependent resource manifests
//! - [`client`] - Injected cluster API surface (mockable in tests)
//! - [`pki`] - Certificate authority and per-notebook certificates
//! - [`retry`] - Constant-interval retry with an observable message stream
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod crd;
pub mod error;
pub mod pki;
pub mod resources;
pub mod retry;

pub use error::{Error, Result};
