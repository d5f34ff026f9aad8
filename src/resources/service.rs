//! Service builder

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

use crate::crd::Notebook;

use super::{dependent_meta, match_labels, NOTEBOOK_PORT, NOTEBOOK_PORT_NAME};

const TOLERATE_UNREADY_ENDPOINTS_ANNOTATION: &str =
    "service.alpha.kubernetes.io/tolerate-unready-endpoints";

/// Build the ClusterIP service fronting the notebook pod.
///
/// The service tolerates unready endpoints so users reach the notebook as
/// soon as the pod accepts connections, before readiness settles.
pub fn build_service(notebook: &Notebook) -> Service {
    let mut metadata = dependent_meta(notebook);
    metadata.annotations = Some(BTreeMap::from([(
        TOLERATE_UNREADY_ENDPOINTS_ANNOTATION.to_string(),
        "true".to_string(),
    )]));

    Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(NOTEBOOK_PORT_NAME.to_string()),
                port: NOTEBOOK_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(match_labels(notebook)),
            ..Default::default()
        }),
        status: None,
    }
}
