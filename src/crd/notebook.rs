//! Notebook Custom Resource Definition
//!
//! A Notebook is a single interactive Jupyter instance run as a stateful
//! workload. The operator materializes a Service, a Secret, a StatefulSet,
//! and optionally an Ingress for every Notebook.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{NotebookFlavor, NotebookIngressBackend, NotebookPhase, NotebookTls};

/// Specification for a Notebook
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "jupyter.squat.ai",
    version = "v1",
    kind = "Notebook",
    plural = "notebooks",
    shortname = "nb",
    shortname = "notebook",
    status = "NotebookStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSpec {
    /// User who owns the notebook.
    pub owner: String,

    /// Whether to add a GPU resource to the notebook pod.
    #[serde(default)]
    pub gpu: bool,

    /// Host to set on the notebook ingress resource. If no host is
    /// provided, no ingress will be created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Ingress backend to use for the notebook ingress resource.
    /// Defaults to the notebook service created by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<NotebookIngressBackend>,

    /// Password to use to access the notebook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// TLS strategy. Defaults to `self-signed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<NotebookTls>,

    /// Image variant to run. Defaults to `minimal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<NotebookFlavor>,

    /// Users who should have access to the notebook.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<String>,
}

impl NotebookSpec {
    /// Validate the notebook specification.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.owner.is_empty() {
            return Err(crate::Error::validation("owner must be a valid username"));
        }
        if let Some(host) = &self.host {
            if !is_dns1123_subdomain(host) {
                return Err(crate::Error::validation(
                    "host must be a valid DNS-1123 subdomain",
                ));
            }
        }
        if let Some(backend) = &self.ingress {
            if backend.service_name.is_empty() || backend.service_port == 0 {
                return Err(crate::Error::validation(
                    "ingress service name and port must be both defined or both undefined",
                ));
            }
        }
        for user in &self.users {
            if user.is_empty() {
                return Err(crate::Error::validation(
                    "users must be a list of valid usernames",
                ));
            }
        }
        Ok(())
    }

    /// Fill unset optional fields with their defaults.
    ///
    /// Only `None` fields are touched, so applying defaults twice yields
    /// the same spec as applying them once.
    pub fn set_defaults(&mut self) {
        if self.tls.is_none() {
            self.tls = Some(NotebookTls::default());
        }
        if self.flavor.is_none() {
            self.flavor = Some(NotebookFlavor::default());
        }
    }
}

/// Status of a Notebook
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookStatus {
    /// Current phase of the notebook.
    #[serde(default)]
    pub phase: NotebookPhase,
}

impl Notebook {
    /// Current phase, `Unknown` when status has not been written yet.
    pub fn phase(&self) -> NotebookPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

/// RFC 1123 subdomain: dot-separated labels of lowercase alphanumerics and
/// dashes, each label 1-63 characters and not starting or ending with a
/// dash, at most 253 characters overall.
fn is_dns1123_subdomain(value: &str) -> bool {
    if value.is_empty() || value.len() > 253 {
        return false;
    }
    value.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    })
}
