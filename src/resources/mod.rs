//! Desired-state builders for notebook dependent resources
//!
//! Each builder is a pure function from a Notebook (plus CA material for
//! the secret) to the manifest the reconcilers drive the cluster towards.
//! Builders are total and deterministic up to the fields the reconcilers
//! copy from live objects (resourceVersion, clusterIP) and freshly
//! generated key material.

mod ingress;
mod secret;
mod service;
mod statefulset;

pub use ingress::build_ingress;
pub use secret::build_secret;
pub use service::build_service;
pub use statefulset::build_stateful_set;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::crd::{Notebook, NotebookTls};

/// Port the notebook server listens on.
pub const NOTEBOOK_PORT: i32 = 8888;
/// Name of the notebook server port on services and containers.
pub const NOTEBOOK_PORT_NAME: &str = "notebook-port";
/// Secret data key holding the PEM-encoded server certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret data key holding the PEM-encoded private key.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
/// Secret data key holding the notebook password.
pub const PASSWORD_KEY: &str = "password";
/// Mount path of the TLS material inside the notebook container.
pub const TLS_MOUNT_PATH: &str = "/var/lib/tls";
/// Label marking a resource as managed by this operator.
pub const MANAGED_BY_LABEL: &str = "managed-by";
/// Value of the managed-by label.
pub const MANAGED_BY_VALUE: &str = "jupyter-operator";

const NOTEBOOK_LABEL: &str = "notebook";
const OWNER_LABEL: &str = "owner";

/// Name of every dependent resource for the notebook with the given name.
pub fn resource_name(name: &str) -> String {
    format!("jupyter-notebook-{name}")
}

/// Name of the ACME-provisioned TLS secret for the notebook's ingress.
pub fn ingress_tls_secret_name(name: &str) -> String {
    format!("{}-tls", resource_name(name))
}

/// Labels connecting the service selector to the notebook pods.
pub fn match_labels(notebook: &Notebook) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NOTEBOOK_LABEL.to_string(), notebook.name_any()),
        (OWNER_LABEL.to_string(), notebook.spec.owner.clone()),
    ])
}

/// Full label set applied to every dependent resource.
pub fn notebook_labels(notebook: &Notebook) -> BTreeMap<String, String> {
    let mut labels = match_labels(notebook);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Whether the object carries this operator's managed-by label.
///
/// The reconcilers never mutate an object that fails this check, even on
/// a name collision.
pub fn is_managed_by_operator(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == MANAGED_BY_VALUE)
}

/// Controller owner reference pointing at the notebook.
pub fn owner_reference(notebook: &Notebook) -> OwnerReference {
    OwnerReference {
        api_version: Notebook::api_version(&()).into_owned(),
        kind: Notebook::kind(&()).into_owned(),
        name: notebook.name_any(),
        uid: notebook.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether the notebook's secret should contain TLS certificates.
pub fn should_have_certs(notebook: &Notebook) -> bool {
    !matches!(notebook.spec.tls, Some(NotebookTls::None))
}

/// Metadata shared by all dependent resources of a notebook.
pub(crate) fn dependent_meta(notebook: &Notebook) -> ObjectMeta {
    ObjectMeta {
        name: Some(resource_name(&notebook.name_any())),
        namespace: notebook.namespace(),
        labels: Some(notebook_labels(notebook)),
        owner_references: Some(vec![owner_reference(notebook)]),
        ..Default::default()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::crd::{Notebook, NotebookSpec};

    /// A notebook named `a` in namespace `u` owned by `u1`, defaults
    /// applied, with a stable uid.
    pub fn notebook() -> Notebook {
        let mut spec = NotebookSpec {
            owner: "u1".to_string(),
            ..Default::default()
        };
        spec.set_defaults();
        let mut notebook = Notebook::new("a", spec);
        notebook.metadata.namespace = Some("u".to_string());
        notebook.metadata.uid = Some("uid-a".to_string());
        notebook
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixtures::notebook;

    #[test]
    fn dependent_resources_are_named_after_the_notebook() {
        assert_eq!(resource_name("a"), "jupyter-notebook-a");
        assert_eq!(ingress_tls_secret_name("a"), "jupyter-notebook-a-tls");
    }

    #[test]
    fn labels_carry_identity_and_management_marker() {
        let n = notebook();
        let labels = notebook_labels(&n);
        assert_eq!(labels.get("notebook").map(String::as_str), Some("a"));
        assert_eq!(labels.get("owner").map(String::as_str), Some("u1"));
        assert_eq!(
            labels.get(MANAGED_BY_LABEL).map(String::as_str),
            Some(MANAGED_BY_VALUE)
        );

        // The selector labels stay free of the management marker so user
        // pods are never accidentally selected across operators.
        let selector = match_labels(&n);
        assert!(!selector.contains_key(MANAGED_BY_LABEL));
    }

    #[test]
    fn managed_by_check_requires_exact_value() {
        let n = notebook();
        let meta = dependent_meta(&n);
        assert!(is_managed_by_operator(&meta));

        let mut foreign = meta.clone();
        foreign
            .labels
            .as_mut()
            .unwrap()
            .insert(MANAGED_BY_LABEL.to_string(), "someone-else".to_string());
        assert!(!is_managed_by_operator(&foreign));

        let unlabeled = ObjectMeta::default();
        assert!(!is_managed_by_operator(&unlabeled));
    }

    #[test]
    fn owner_reference_links_back_by_uid() {
        let n = notebook();
        let reference = owner_reference(&n);
        assert_eq!(reference.kind, "Notebook");
        assert_eq!(reference.api_version, "jupyter.squat.ai/v1");
        assert_eq!(reference.name, "a");
        assert_eq!(reference.uid, "uid-a");
        assert_eq!(reference.controller, Some(true));
        assert_eq!(reference.block_owner_deletion, Some(true));
    }

    #[test]
    fn certs_follow_tls_strategy() {
        use crate::crd::NotebookTls;
        let mut n = notebook();
        assert!(should_have_certs(&n)); // self-signed default
        n.spec.tls = Some(NotebookTls::Acme);
        assert!(should_have_certs(&n));
        n.spec.tls = Some(NotebookTls::None);
        assert!(!should_have_certs(&n));
    }
}
