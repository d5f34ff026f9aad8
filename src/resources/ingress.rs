//! Ingress builder

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use kube::ResourceExt;

use crate::crd::{Notebook, NotebookTls};

use super::{
    dependent_meta, ingress_tls_secret_name, resource_name, should_have_certs, NOTEBOOK_PORT,
};

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";
const TLS_ACME_ANNOTATION: &str = "kubernetes.io/tls-acme";
const SSL_PASSTHROUGH_ANNOTATION: &str = "nginx.ingress.kubernetes.io/ssl-passthrough";
const BACKEND_PROTOCOL_ANNOTATION: &str = "nginx.ingress.kubernetes.io/backend-protocol";
const SSL_REDIRECT_ANNOTATION: &str = "nginx.ingress.kubernetes.io/ssl-redirect";

/// Build the ingress exposing the notebook at `<name>.<spec.host>`.
///
/// Only called when the notebook has a host (the should-exist guard);
/// with `acme` the TLS secret is provisioned by the ACME controller under
/// `<resource-name>-tls`, with `self-signed` traffic passes through to
/// the pod which terminates TLS itself.
pub fn build_ingress(notebook: &Notebook) -> Ingress {
    let name = notebook.name_any();
    let host = format!(
        "{}.{}",
        name,
        notebook.spec.host.as_deref().unwrap_or_default()
    );

    let backend = match &notebook.spec.ingress {
        Some(backend) => IngressBackend {
            service: Some(IngressServiceBackend {
                name: backend.service_name.clone(),
                port: Some(ServiceBackendPort {
                    number: Some(backend.service_port),
                    name: None,
                }),
            }),
            resource: None,
        },
        None => IngressBackend {
            service: Some(IngressServiceBackend {
                name: resource_name(&name),
                port: Some(ServiceBackendPort {
                    number: Some(NOTEBOOK_PORT),
                    name: None,
                }),
            }),
            resource: None,
        },
    };

    let mut annotations = BTreeMap::from([(
        INGRESS_CLASS_ANNOTATION.to_string(),
        "nginx".to_string(),
    )]);

    let mut tls = None;
    if should_have_certs(notebook) {
        let mut entry = IngressTLS {
            hosts: Some(vec![host.clone()]),
            secret_name: None,
        };
        if matches!(notebook.spec.tls, Some(NotebookTls::Acme)) {
            entry.secret_name = Some(ingress_tls_secret_name(&name));
            annotations.insert(TLS_ACME_ANNOTATION.to_string(), "true".to_string());
        } else {
            annotations.insert(SSL_PASSTHROUGH_ANNOTATION.to_string(), "true".to_string());
        }
        annotations.insert(BACKEND_PROTOCOL_ANNOTATION.to_string(), "HTTPS".to_string());
        annotations.insert(SSL_REDIRECT_ANNOTATION.to_string(), "true".to_string());
        tls = Some(vec![entry]);
    }

    let mut metadata = dependent_meta(notebook);
    metadata.annotations = Some(annotations);

    Ingress {
        metadata,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend,
                    }],
                }),
            }]),
            tls,
            ..Default::default()
        }),
        status: None,
    }
}
