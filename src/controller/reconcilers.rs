//! Per-resource reconcilers
//!
//! Every dependent kind follows the same protocol: decide whether the
//! resource should exist, then create, adopt-and-update, or delete it.
//! Adoption requires the operator's managed-by label; a name collision
//! with a foreign object is refused without mutating it. The four
//! reconcilers run concurrently per notebook and their errors are joined
//! into a single failure.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::ClusterClient;
use crate::crd::{Notebook, NotebookTls};
use crate::pki::CertificateAuthority;
use crate::resources::{
    build_ingress, build_secret, build_service, build_stateful_set, ingress_tls_secret_name,
    is_managed_by_operator, resource_name, should_have_certs, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use crate::retry;
use crate::{Error, Result};

use super::cache::{Caches, ObjectCache};

const WAIT_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Should-exist predicates
// =============================================================================

pub(crate) fn service_should_exist(notebook: &Notebook) -> bool {
    notebook.metadata.deletion_timestamp.is_none()
}

pub(crate) fn stateful_set_should_exist(notebook: &Notebook) -> bool {
    notebook.metadata.deletion_timestamp.is_none()
}

pub(crate) fn secret_should_exist(notebook: &Notebook) -> bool {
    if notebook.metadata.deletion_timestamp.is_some() {
        return false;
    }
    notebook
        .spec
        .password
        .as_deref()
        .is_some_and(|p| !p.is_empty())
        || should_have_certs(notebook)
}

pub(crate) fn ingress_should_exist(notebook: &Notebook) -> bool {
    if notebook.metadata.deletion_timestamp.is_some() {
        return false;
    }
    notebook.spec.host.as_deref().is_some_and(|h| !h.is_empty())
}

// =============================================================================
// Per-kind reconcilers
// =============================================================================

/// Create or update the notebook's service.
pub(crate) async fn reconcile_service(
    client: &dyn ClusterClient,
    services: &ObjectCache<Service>,
    notebook: &Notebook,
) -> Result<()> {
    let mut desired = build_service(notebook);
    let namespace = notebook.namespace().unwrap_or_default();
    let name = resource_name(&notebook.name_any());

    let Some(live) = services.get(&format!("{namespace}/{name}")) else {
        return client.create_service(&namespace, &desired).await;
    };
    if !is_managed_by_operator(&live.metadata) {
        return Err(Error::AdoptionRefused {
            kind: "Service",
            name,
        });
    }

    desired.metadata.resource_version = live.metadata.resource_version.clone();
    if let (Some(desired_spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
        desired_spec.cluster_ip = live_spec.cluster_ip.clone();
    }
    // Status is server-owned; fold it in so steady state compares equal.
    desired.status = live.status.clone();
    if *live == desired {
        return Ok(());
    }
    client.update_service(&namespace, &desired).await
}

/// Create or update the notebook's secret.
///
/// A live certificate still signed by the current CA is kept as-is so
/// reconciles do not churn key material.
pub(crate) async fn reconcile_secret(
    client: &dyn ClusterClient,
    secrets: &ObjectCache<Secret>,
    ca: &CertificateAuthority,
    notebook: &Notebook,
) -> Result<()> {
    let mut desired = build_secret(notebook, ca)?;
    let namespace = notebook.namespace().unwrap_or_default();
    let name = resource_name(&notebook.name_any());

    let Some(live) = secrets.get(&format!("{namespace}/{name}")) else {
        return client.create_secret(&namespace, &desired).await;
    };
    if !is_managed_by_operator(&live.metadata) {
        return Err(Error::AdoptionRefused {
            kind: "Secret",
            name,
        });
    }

    if let Some(live_data) = live.data.as_ref() {
        if let (Some(live_cert), Some(live_key)) = (
            live_data.get(TLS_CERT_KEY),
            live_data.get(TLS_PRIVATE_KEY_KEY),
        ) {
            let wants_certs = desired
                .data
                .as_ref()
                .is_some_and(|data| data.contains_key(TLS_CERT_KEY));
            if wants_certs && ca.is_issuer_of(&live_cert.0) {
                let data = desired.data.get_or_insert_with(Default::default);
                data.insert(TLS_CERT_KEY.to_string(), live_cert.clone());
                data.insert(TLS_PRIVATE_KEY_KEY.to_string(), live_key.clone());
            }
        }
    }

    desired.metadata.resource_version = live.metadata.resource_version.clone();
    if *live == desired {
        return Ok(());
    }
    client.update_secret(&namespace, &desired).await
}

/// Create or update the notebook's stateful set.
///
/// The pod template is immutable in place: when it differs from the live
/// one, the stateful set is deleted with foreground propagation, the
/// deletion is awaited through the cache, and a fresh one is created.
pub(crate) async fn reconcile_stateful_set(
    client: &dyn ClusterClient,
    stateful_sets: &Arc<ObjectCache<StatefulSet>>,
    notebook: &Notebook,
    stop: &CancellationToken,
) -> Result<()> {
    let mut desired = build_stateful_set(notebook);
    let namespace = notebook.namespace().unwrap_or_default();
    let name = resource_name(&notebook.name_any());

    let Some(live) = stateful_sets.get(&format!("{namespace}/{name}")) else {
        return client.create_stateful_set(&namespace, &desired).await;
    };
    if !is_managed_by_operator(&live.metadata) {
        return Err(Error::AdoptionRefused {
            kind: "StatefulSet",
            name,
        });
    }

    let templates_equal = desired.spec.as_ref().map(|s| &s.template)
        == live.spec.as_ref().map(|s| &s.template);
    if templates_equal {
        desired.metadata.resource_version = live.metadata.resource_version.clone();
        desired.spec = live.spec.clone();
        desired.status = live.status.clone();
        if *live == desired {
            return Ok(());
        }
        return client.update_stateful_set(&namespace, &desired).await;
    }

    client
        .delete_stateful_set_foreground(&namespace, &name)
        .await
        .map_err(|err| {
            Error::reconcile(format!(
                "failed to delete old StatefulSet before updating: {err}"
            ))
        })?;
    wait_for_stateful_set_deleted(
        Arc::clone(stateful_sets),
        namespace.clone(),
        name,
        stop.clone(),
    )
    .await?;
    client.create_stateful_set(&namespace, &desired).await
}

/// Create or update the notebook's ingress.
pub(crate) async fn reconcile_ingress(
    client: &dyn ClusterClient,
    ingresses: &ObjectCache<Ingress>,
    notebook: &Notebook,
) -> Result<()> {
    let mut desired = build_ingress(notebook);
    let namespace = notebook.namespace().unwrap_or_default();
    let name = resource_name(&notebook.name_any());

    let Some(live) = ingresses.get(&format!("{namespace}/{name}")) else {
        return client.create_ingress(&namespace, &desired).await;
    };
    if !is_managed_by_operator(&live.metadata) {
        return Err(Error::AdoptionRefused {
            kind: "Ingress",
            name,
        });
    }

    desired.metadata.resource_version = live.metadata.resource_version.clone();
    desired.status = live.status.clone();
    if *live == desired {
        return Ok(());
    }
    client.update_ingress(&namespace, &desired).await
}

// =============================================================================
// Readiness waits
// =============================================================================

/// Poll the cache until the stateful set reports all replicas ready.
pub(crate) async fn wait_for_stateful_set(
    stateful_sets: Arc<ObjectCache<StatefulSet>>,
    namespace: String,
    name: String,
    stop: CancellationToken,
) -> Result<()> {
    let key = format!("{namespace}/{name}");
    let bounded = retry::deadline(&stop, WAIT_TIMEOUT);
    let poll_key = key.clone();
    let mut messages = retry::retry(WAIT_INTERVAL, bounded, move || {
        let stateful_sets = Arc::clone(&stateful_sets);
        let key = poll_key.clone();
        async move {
            let Some(live) = stateful_sets.get(&key) else {
                return Err(Error::wait(format!("StatefulSet {key} not yet created")));
            };
            let want = live.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let ready = live.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
            if ready == want {
                Ok(())
            } else {
                Err(Error::wait(format!(
                    "ready replicas is {ready}, waiting for ready replicas to be {want}"
                )))
            }
        }
    });

    while let Some(message) = messages.recv().await {
        if message.done {
            return match message.error {
                None => {
                    info!(stateful_set = %key, "StatefulSet is ready");
                    Ok(())
                }
                Some(err) => Err(Error::readiness(format!(
                    "StatefulSet {key} did not become ready: {err}"
                ))),
            };
        }
        if let Some(err) = message.error {
            debug!(stateful_set = %key, error = %err, "StatefulSet is not yet ready");
        }
    }
    Err(Error::readiness(format!(
        "StatefulSet {key} did not become ready"
    )))
}

/// Poll the cache until the stateful set is gone.
pub(crate) async fn wait_for_stateful_set_deleted(
    stateful_sets: Arc<ObjectCache<StatefulSet>>,
    namespace: String,
    name: String,
    stop: CancellationToken,
) -> Result<()> {
    let key = format!("{namespace}/{name}");
    let bounded = retry::deadline(&stop, WAIT_TIMEOUT);
    let poll_key = key.clone();
    let mut messages = retry::retry(WAIT_INTERVAL, bounded, move || {
        let stateful_sets = Arc::clone(&stateful_sets);
        let key = poll_key.clone();
        async move {
            if stateful_sets.get(&key).is_none() {
                Ok(())
            } else {
                Err(Error::wait(format!("waiting for StatefulSet {key} to be deleted")))
            }
        }
    });

    while let Some(message) = messages.recv().await {
        if message.done {
            return match message.error {
                None => {
                    info!(stateful_set = %key, "StatefulSet deleted");
                    Ok(())
                }
                Some(err) => Err(Error::readiness(format!(
                    "StatefulSet {key} was not deleted: {err}"
                ))),
            };
        }
        if let Some(err) = message.error {
            debug!(stateful_set = %key, error = %err, "StatefulSet is not yet deleted");
        }
    }
    Err(Error::readiness(format!("StatefulSet {key} was not deleted")))
}

/// Poll the cache until the ACME controller provisions the ingress TLS
/// secret.
pub(crate) async fn wait_for_ingress_tls_secret(
    secrets: Arc<ObjectCache<Secret>>,
    namespace: String,
    notebook_name: String,
    stop: CancellationToken,
) -> Result<()> {
    let key = format!("{namespace}/{}", ingress_tls_secret_name(&notebook_name));
    let bounded = retry::deadline(&stop, WAIT_TIMEOUT);
    let poll_key = key.clone();
    let mut messages = retry::retry(WAIT_INTERVAL, bounded, move || {
        let secrets = Arc::clone(&secrets);
        let key = poll_key.clone();
        async move {
            if secrets.get(&key).is_some() {
                Ok(())
            } else {
                Err(Error::wait(format!("ingress TLS secret {key} not yet provisioned")))
            }
        }
    });

    while let Some(message) = messages.recv().await {
        if message.done {
            return match message.error {
                None => {
                    info!(secret = %key, "ingress TLS secret is ready");
                    Ok(())
                }
                Some(err) => Err(Error::readiness(format!(
                    "ingress TLS secret {key} never appeared: {err}"
                ))),
            };
        }
        if let Some(err) = message.error {
            debug!(secret = %key, error = %err, "ingress TLS secret is not yet ready");
        }
    }
    Err(Error::readiness(format!(
        "ingress TLS secret {key} never appeared"
    )))
}

// =============================================================================
// Fan-out
// =============================================================================

struct ResourcePlan<'a> {
    kind: &'static str,
    apply: BoxFuture<'a, Result<()>>,
    wait: Option<BoxFuture<'a, Result<()>>>,
}

fn plans<'a>(
    client: &'a dyn ClusterClient,
    caches: &'a Caches,
    ca: &'a CertificateAuthority,
    notebook: &'a Notebook,
    stop: &'a CancellationToken,
) -> Vec<ResourcePlan<'a>> {
    let namespace = notebook.namespace().unwrap_or_default();
    let name = resource_name(&notebook.name_any());
    let mut plans = Vec::with_capacity(4);

    plans.push(if service_should_exist(notebook) {
        ResourcePlan {
            kind: "Service",
            apply: Box::pin(reconcile_service(client, &caches.services, notebook)),
            wait: None,
        }
    } else {
        let namespace = namespace.clone();
        let name = name.clone();
        ResourcePlan {
            kind: "Service",
            apply: Box::pin(async move {
                if caches.services.get(&format!("{namespace}/{name}")).is_none() {
                    return Ok(());
                }
                client.delete_service(&namespace, &name).await
            }),
            wait: None,
        }
    });

    plans.push(if secret_should_exist(notebook) {
        ResourcePlan {
            kind: "Secret",
            apply: Box::pin(reconcile_secret(client, &caches.secrets, ca, notebook)),
            wait: None,
        }
    } else {
        let namespace = namespace.clone();
        let name = name.clone();
        ResourcePlan {
            kind: "Secret",
            apply: Box::pin(async move {
                if caches.secrets.get(&format!("{namespace}/{name}")).is_none() {
                    return Ok(());
                }
                client.delete_secret(&namespace, &name).await
            }),
            wait: None,
        }
    });

    plans.push(if stateful_set_should_exist(notebook) {
        ResourcePlan {
            kind: "StatefulSet",
            apply: Box::pin(reconcile_stateful_set(
                client,
                &caches.stateful_sets,
                notebook,
                stop,
            )),
            wait: Some(Box::pin(wait_for_stateful_set(
                Arc::clone(&caches.stateful_sets),
                namespace.clone(),
                name.clone(),
                stop.clone(),
            ))),
        }
    } else {
        let namespace = namespace.clone();
        let name = name.clone();
        ResourcePlan {
            kind: "StatefulSet",
            apply: Box::pin(async move {
                if caches
                    .stateful_sets
                    .get(&format!("{namespace}/{name}"))
                    .is_none()
                {
                    return Ok(());
                }
                client.delete_stateful_set(&namespace, &name).await
            }),
            wait: None,
        }
    });

    plans.push(if ingress_should_exist(notebook) {
        let wait: Option<BoxFuture<'a, Result<()>>> =
            if matches!(notebook.spec.tls, Some(NotebookTls::Acme)) {
                Some(Box::pin(wait_for_ingress_tls_secret(
                    Arc::clone(&caches.secrets),
                    namespace.clone(),
                    notebook.name_any(),
                    stop.clone(),
                )))
            } else {
                None
            };
        ResourcePlan {
            kind: "Ingress",
            apply: Box::pin(reconcile_ingress(client, &caches.ingresses, notebook)),
            wait,
        }
    } else {
        ResourcePlan {
            kind: "Ingress",
            apply: Box::pin(async move {
                if caches.ingresses.get(&format!("{namespace}/{name}")).is_none() {
                    return Ok(());
                }
                client.delete_ingress(&namespace, &name).await
            }),
            wait: None,
        }
    });

    plans
}

async fn run_plan(plan: ResourcePlan<'_>) -> Result<()> {
    match plan.apply.await {
        Ok(()) => {}
        Err(err) if err.is_benign() => {
            debug!(resource = plan.kind, "already reconciled");
        }
        Err(err) => return Err(err),
    }
    if let Some(wait) = plan.wait {
        wait.await?;
    }
    Ok(())
}

/// Reconcile all four dependent resources of a notebook concurrently,
/// joining failures into a single error.
pub(crate) async fn reconcile_notebook_resources(
    client: &dyn ClusterClient,
    caches: &Caches,
    ca: &CertificateAuthority,
    notebook: &Notebook,
    stop: &CancellationToken,
) -> Result<()> {
    let name = notebook.name_any();
    let results = join_all(plans(client, caches, ca, notebook, stop).into_iter().map(
        |plan| async move {
            let kind = plan.kind;
            (kind, run_plan(plan).await)
        },
    ))
    .await;

    let mut failures = Vec::new();
    for (kind, result) in results {
        match result {
            Ok(()) => debug!(resource = kind, notebook = %name, "reconciled"),
            Err(err) => {
                error!(resource = kind, notebook = %name, error = %err, "failed to reconcile");
                failures.push(err.to_string());
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::reconcile(format!(
            "failed to reconcile notebook resources for {name}: {}",
            failures.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::crd::NotebookFlavor;
    use crate::resources::fixtures::notebook;
    use crate::resources::{MANAGED_BY_LABEL, PASSWORD_KEY};
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn ca() -> CertificateAuthority {
        CertificateAuthority::new("test-ca").unwrap()
    }

    /// The live object a previous reconcile would have left behind:
    /// the builder output plus server-set fields.
    fn live_service(n: &Notebook) -> Service {
        let mut service = build_service(n);
        service.metadata.resource_version = Some("5".to_string());
        service.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.1".to_string());
        service
    }

    fn live_stateful_set(n: &Notebook) -> StatefulSet {
        let mut sts = build_stateful_set(n);
        sts.metadata.resource_version = Some("7".to_string());
        sts.status = Some(StatefulSetStatus {
            ready_replicas: Some(1),
            replicas: 1,
            ..Default::default()
        });
        sts
    }

    // =========================================================================
    // Create-or-adopt-or-update
    // =========================================================================

    #[tokio::test]
    async fn missing_service_is_created() {
        let n = notebook();
        let services = ObjectCache::new();
        let mut client = MockClusterClient::new();
        client
            .expect_create_service()
            .withf(|namespace, service: &Service| {
                namespace == "u" && service.metadata.name.as_deref() == Some("jupyter-notebook-a")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile_service(&client, &services, &n).await.unwrap();
    }

    /// A name-colliding service without the managed-by label is left
    /// strictly alone: no mutating call reaches the client.
    #[tokio::test]
    async fn story_foreign_service_is_not_adopted() {
        let n = notebook();
        let services = ObjectCache::new();
        let mut foreign = live_service(&n);
        foreign.metadata.labels.as_mut().unwrap().remove(MANAGED_BY_LABEL);
        services.insert(foreign);

        // No expectations: any client call panics the test.
        let client = MockClusterClient::new();
        let err = reconcile_service(&client, &services, &n).await.unwrap_err();
        assert!(matches!(err, Error::AdoptionRefused { kind: "Service", .. }));
    }

    #[tokio::test]
    async fn managed_service_is_updated_with_merged_fields() {
        let mut n = notebook();
        let services = ObjectCache::new();
        services.insert(live_service(&n));

        // The spec changed since the live object was written.
        n.spec.owner = "u2".to_string();

        let mut client = MockClusterClient::new();
        client
            .expect_update_service()
            .withf(|_, service: &Service| {
                service.metadata.resource_version.as_deref() == Some("5")
                    && service.spec.as_ref().unwrap().cluster_ip.as_deref() == Some("10.0.0.1")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile_service(&client, &services, &n).await.unwrap();
    }

    /// Steady state issues no writes: the merged desired object equals
    /// the live one, so the second reconcile pass is a no-op.
    #[tokio::test]
    async fn story_steady_state_service_issues_no_writes() {
        let n = notebook();
        let services = ObjectCache::new();
        services.insert(live_service(&n));

        let client = MockClusterClient::new();
        reconcile_service(&client, &services, &n).await.unwrap();
    }

    // =========================================================================
    // Secret certificate handling
    // =========================================================================

    #[tokio::test]
    async fn steady_secret_keeps_its_certificate() {
        let ca = ca();
        let n = notebook();
        let secrets = ObjectCache::new();
        let mut live = build_secret(&n, &ca).unwrap();
        live.metadata.resource_version = Some("3".to_string());
        secrets.insert(live);

        // Fresh key material is generated every build, but the live
        // certificate still verifies, so nothing is written.
        let client = MockClusterClient::new();
        reconcile_secret(&client, &secrets, &ca, &n).await.unwrap();
    }

    #[tokio::test]
    async fn certificate_from_an_old_ca_is_replaced() {
        let current = ca();
        let previous = ca();
        let n = notebook();

        let secrets = ObjectCache::new();
        let mut live = build_secret(&n, &previous).unwrap();
        live.metadata.resource_version = Some("3".to_string());
        let stale_cert = live.data.as_ref().unwrap().get(TLS_CERT_KEY).unwrap().clone();
        secrets.insert(live);

        let mut client = MockClusterClient::new();
        client
            .expect_update_secret()
            .withf(move |_, secret: &Secret| {
                let data = secret.data.as_ref().unwrap();
                data.get(TLS_CERT_KEY) != Some(&stale_cert)
                    && secret.metadata.resource_version.as_deref() == Some("3")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile_secret(&client, &secrets, &current, &n).await.unwrap();
    }

    #[tokio::test]
    async fn password_change_updates_the_secret_but_keeps_certs() {
        let ca = ca();
        let mut n = notebook();
        let secrets = ObjectCache::new();
        let mut live = build_secret(&n, &ca).unwrap();
        live.metadata.resource_version = Some("3".to_string());
        let live_cert = live.data.as_ref().unwrap().get(TLS_CERT_KEY).unwrap().clone();
        secrets.insert(live);

        n.spec.password = Some("p".to_string());

        let mut client = MockClusterClient::new();
        client
            .expect_update_secret()
            .withf(move |_, secret: &Secret| {
                let data = secret.data.as_ref().unwrap();
                data.get(PASSWORD_KEY).map(|v| v.0.as_slice()) == Some(b"p".as_slice())
                    && data.get(TLS_CERT_KEY) == Some(&live_cert)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile_secret(&client, &secrets, &ca, &n).await.unwrap();
    }

    // =========================================================================
    // StatefulSet template handling
    // =========================================================================

    #[tokio::test]
    async fn steady_stateful_set_issues_no_writes() {
        let n = notebook();
        let stateful_sets = Arc::new(ObjectCache::new());
        stateful_sets.insert(live_stateful_set(&n));

        let client = MockClusterClient::new();
        let stop = CancellationToken::new();
        reconcile_stateful_set(&client, &stateful_sets, &n, &stop)
            .await
            .unwrap();
    }

    /// Changing the flavor changes the pod template, which cannot be
    /// updated in place: the old stateful set is deleted with foreground
    /// propagation and a fresh one created.
    #[tokio::test(start_paused = true)]
    async fn story_template_change_recreates_the_stateful_set() {
        let n = notebook();
        let stateful_sets = Arc::new(ObjectCache::new());
        stateful_sets.insert(live_stateful_set(&n));

        let mut changed = notebook();
        changed.spec.flavor = Some(NotebookFlavor::Scipy);

        let mut client = MockClusterClient::new();
        let cache_for_delete = Arc::clone(&stateful_sets);
        client
            .expect_delete_stateful_set_foreground()
            .withf(|namespace, name| namespace == "u" && name == "jupyter-notebook-a")
            .times(1)
            .returning(move |namespace, name| {
                // Foreground deletion completes; the informer drops the
                // object from the cache.
                cache_for_delete.remove(&format!("{namespace}/{name}"));
                Ok(())
            });
        client
            .expect_create_stateful_set()
            .withf(|_, sts: &StatefulSet| {
                let image = sts.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers
                    [0]
                .image
                .as_deref();
                image == Some("jupyter/scipy-notebook:latest")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let stop = CancellationToken::new();
        reconcile_stateful_set(&client, &stateful_sets, &changed, &stop)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn metadata_drift_with_equal_template_updates_in_place() {
        let n = notebook();
        let stateful_sets = Arc::new(ObjectCache::new());
        let mut live = live_stateful_set(&n);
        live.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("stray".to_string(), "label".to_string());
        stateful_sets.insert(live);

        let mut client = MockClusterClient::new();
        client
            .expect_update_stateful_set()
            .withf(|_, sts: &StatefulSet| {
                sts.metadata.resource_version.as_deref() == Some("7")
                    && !sts.metadata.labels.as_ref().unwrap().contains_key("stray")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let stop = CancellationToken::new();
        reconcile_stateful_set(&client, &stateful_sets, &n, &stop)
            .await
            .unwrap();
    }

    // =========================================================================
    // Readiness waits
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn stateful_set_wait_succeeds_once_replicas_are_ready() {
        let n = notebook();
        let stateful_sets = Arc::new(ObjectCache::new());

        let mut pending = live_stateful_set(&n);
        pending.status.as_mut().unwrap().ready_replicas = Some(0);
        stateful_sets.insert(pending);

        let cache = Arc::clone(&stateful_sets);
        let readiness = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            let mut ready = live_stateful_set(&notebook());
            ready.status.as_mut().unwrap().ready_replicas = Some(1);
            cache.insert(ready);
        });

        wait_for_stateful_set(
            stateful_sets,
            "u".to_string(),
            "jupyter-notebook-a".to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        readiness.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stateful_set_wait_times_out() {
        let stateful_sets: Arc<ObjectCache<StatefulSet>> = Arc::new(ObjectCache::new());
        let err = wait_for_stateful_set(
            stateful_sets,
            "u".to_string(),
            "jupyter-notebook-a".to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Readiness(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn acme_wait_resolves_when_the_tls_secret_appears() {
        let secrets = Arc::new(ObjectCache::new());
        let cache = Arc::clone(&secrets);
        let provisioner = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            let mut secret = Secret::default();
            secret.metadata.name = Some("jupyter-notebook-a-tls".to_string());
            secret.metadata.namespace = Some("u".to_string());
            cache.insert(secret);
        });

        wait_for_ingress_tls_secret(
            secrets,
            "u".to_string(),
            "a".to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        provisioner.await.unwrap();
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// A minimal self-signed notebook converges to a service, a secret
    /// with certificates, and a stateful set; no ingress exists and no
    /// delete is issued for it because nothing is cached.
    #[tokio::test(start_paused = true)]
    async fn story_minimal_notebook_fan_out() {
        let n = notebook();
        let ca = ca();
        let caches = Caches::new();

        let mut client = MockClusterClient::new();
        client.expect_create_service().times(1).returning(|_, _| Ok(()));
        client
            .expect_create_secret()
            .withf(|_, secret: &Secret| {
                secret.data.as_ref().unwrap().contains_key(TLS_CERT_KEY)
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let sts_cache = Arc::clone(&caches.stateful_sets);
        client
            .expect_create_stateful_set()
            .times(1)
            .returning(move |_, sts| {
                let mut created = sts.clone();
                created.status = Some(StatefulSetStatus {
                    ready_replicas: Some(1),
                    replicas: 1,
                    ..Default::default()
                });
                sts_cache.insert(created);
                Ok(())
            });

        let stop = CancellationToken::new();
        reconcile_notebook_resources(&client, &caches, &ca, &n, &stop)
            .await
            .unwrap();
    }

    /// Deleting a notebook drives every reconciler through its delete
    /// branch for the dependents that still exist.
    #[tokio::test]
    async fn story_deletion_fans_out_to_all_dependents() {
        let ca = ca();
        let mut n = notebook();
        n.spec.host = Some("example.com".to_string());

        let caches = Caches::new();
        caches.services.insert(live_service(&n));
        caches
            .secrets
            .insert({
                let mut secret = build_secret(&n, &ca).unwrap();
                secret.metadata.resource_version = Some("2".to_string());
                secret
            });
        caches.stateful_sets.insert(live_stateful_set(&n));
        caches.ingresses.insert({
            let mut ingress = build_ingress(&n);
            ingress.metadata.resource_version = Some("4".to_string());
            ingress
        });

        n.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let mut client = MockClusterClient::new();
        client.expect_delete_service().times(1).returning(|_, _| Ok(()));
        client.expect_delete_secret().times(1).returning(|_, _| Ok(()));
        client
            .expect_delete_stateful_set()
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_delete_ingress().times(1).returning(|_, _| Ok(()));

        let stop = CancellationToken::new();
        reconcile_notebook_resources(&client, &caches, &ca, &n, &stop)
            .await
            .unwrap();
    }

    /// A delete racing the garbage collector folds to success.
    #[tokio::test]
    async fn benign_races_do_not_fail_the_fan_out() {
        let ca = ca();
        let mut n = notebook();
        n.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let caches = Caches::new();
        caches.services.insert(live_service(&n));

        let mut client = MockClusterClient::new();
        client.expect_delete_service().times(1).returning(|_, _| {
            Err(Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            })))
        });

        let stop = CancellationToken::new();
        reconcile_notebook_resources(&client, &caches, &ca, &n, &stop)
            .await
            .unwrap();
    }

    /// Sub-reconciler failures are joined into one error naming each
    /// failing resource.
    #[tokio::test(start_paused = true)]
    async fn failures_are_joined() {
        let ca = ca();
        let n = notebook();
        let caches = Caches::new();

        // Foreign objects under both colliding names.
        let mut foreign_service = live_service(&n);
        foreign_service.metadata.labels = None;
        caches.services.insert(foreign_service);
        let mut foreign_secret = build_secret(&n, &ca).unwrap();
        foreign_secret.metadata.labels = None;
        foreign_secret.metadata.resource_version = Some("1".to_string());
        caches.secrets.insert(foreign_secret);

        let sts_cache = Arc::clone(&caches.stateful_sets);
        let mut client = MockClusterClient::new();
        client
            .expect_create_stateful_set()
            .times(1)
            .returning(move |_, sts| {
                let mut created = sts.clone();
                created.status = Some(StatefulSetStatus {
                    ready_replicas: Some(1),
                    replicas: 1,
                    ..Default::default()
                });
                sts_cache.insert(created);
                Ok(())
            });

        let stop = CancellationToken::new();
        let err = reconcile_notebook_resources(&client, &caches, &ca, &n, &stop)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("refusing to adopt"));
        assert!(message.contains("; "), "errors are joined: {message}");
    }

    // =========================================================================
    // Should-exist predicates
    // =========================================================================

    #[test]
    fn predicates_follow_the_notebook_shape() {
        use crate::crd::NotebookTls;

        let mut n = notebook();
        assert!(service_should_exist(&n));
        assert!(stateful_set_should_exist(&n));
        // Default TLS is self-signed: certs required.
        assert!(secret_should_exist(&n));
        assert!(!ingress_should_exist(&n));

        n.spec.host = Some("example.com".to_string());
        assert!(ingress_should_exist(&n));

        n.spec.tls = Some(NotebookTls::None);
        assert!(!secret_should_exist(&n));
        n.spec.password = Some("p".to_string());
        assert!(secret_should_exist(&n));

        n.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!service_should_exist(&n));
        assert!(!stateful_set_should_exist(&n));
        assert!(!secret_should_exist(&n));
        assert!(!ingress_should_exist(&n));
    }
}
