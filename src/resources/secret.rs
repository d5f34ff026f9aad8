//! Secret builder

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use crate::crd::Notebook;
use crate::pki::CertificateAuthority;
use crate::Error;

use super::{dependent_meta, should_have_certs, PASSWORD_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

/// Build the secret holding the notebook's credentials and TLS material.
///
/// When the TLS strategy is not `none`, a fresh key pair is generated and
/// signed by the operator's CA with the notebook name as common name and
/// the notebook host (when set) as a DNS subject alternative name. The
/// secret reconciler keeps a live certificate that still verifies against
/// the CA, so the fresh material here is only written on first creation
/// or after a CA rotation.
pub fn build_secret(notebook: &Notebook, ca: &CertificateAuthority) -> Result<Secret, Error> {
    let mut data: BTreeMap<String, ByteString> = BTreeMap::new();

    if should_have_certs(notebook) {
        let mut dns_names = Vec::new();
        if let Some(host) = notebook.spec.host.as_deref() {
            if !host.is_empty() {
                dns_names.push(host.to_string());
            }
        }
        let issued = ca.issue(&notebook.name_any(), &dns_names)?;
        data.insert(
            TLS_CERT_KEY.to_string(),
            ByteString(issued.cert_pem.into_bytes()),
        );
        data.insert(
            TLS_PRIVATE_KEY_KEY.to_string(),
            ByteString(issued.key_pem.into_bytes()),
        );
    }

    if let Some(password) = notebook.spec.password.as_deref() {
        if !password.is_empty() {
            data.insert(
                PASSWORD_KEY.to_string(),
                ByteString(password.as_bytes().to_vec()),
            );
        }
    }

    Ok(Secret {
        metadata: dependent_meta(notebook),
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}
