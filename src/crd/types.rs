//! Shared enums and helper types for the Notebook CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Phase of a notebook at the current time
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NotebookPhase {
    /// The notebook has been accepted and validated but not all of its
    /// resources are ready.
    Pending,
    /// All of the notebook's resources are ready.
    Running,
    /// The system was unable to create at least one of the notebook's
    /// resources.
    Failed,
    /// The state of the notebook could not be determined.
    #[default]
    Unknown,
}

/// TLS strategy for a notebook
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NotebookTls {
    /// Serve HTTPS with certificates signed by the operator's CA. Ingress
    /// traffic terminates TLS at the notebook, not at the ingress
    /// controller.
    #[default]
    SelfSigned,
    /// Serve HTTPS with operator-signed certificates while the ingress
    /// controller terminates TLS using ACME-provisioned certificates.
    /// Requires kube-lego or an equivalent in the cluster.
    Acme,
    /// Serve plain HTTP with no encryption.
    None,
}

/// Image variant for the notebook container
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NotebookFlavor {
    /// Plain Jupyter with no extra libraries.
    #[default]
    Minimal,
    /// Scientific Python stack.
    Scipy,
    /// R kernel and libraries.
    R,
    /// TensorFlow stack.
    Tensorflow,
    /// Data science stack (Python, R, Julia).
    Datascience,
    /// PySpark stack.
    Pyspark,
    /// Spark with Scala support.
    AllSpark,
}

impl NotebookFlavor {
    /// Image name fragment for this flavor, e.g. `scipy` in
    /// `jupyter/scipy-notebook:latest`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Scipy => "scipy",
            Self::R => "r",
            Self::Tensorflow => "tensorflow",
            Self::Datascience => "datascience",
            Self::Pyspark => "pyspark",
            Self::AllSpark => "all-spark",
        }
    }
}

/// Override for the backend of the notebook ingress resource.
///
/// Defaults to the service created by the operator when unset.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookIngressBackend {
    /// Name of the backend service.
    pub service_name: String,
    /// Port of the backend service.
    pub service_port: i32,
}
