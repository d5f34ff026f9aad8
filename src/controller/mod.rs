//! The notebook reconciliation engine
//!
//! Wires informer caches, the work queue, the event dispatcher, and the
//! per-resource reconcilers into the controller: watch five kinds, derive
//! one work item per notebook, serialize work per key while parallelizing
//! across keys, and drive each notebook through its phase state machine.

mod cache;
mod dispatcher;
mod queue;
mod reconcilers;

pub use cache::{object_key, Caches, EventHandler, ObjectCache};
pub use dispatcher::{DependentHandler, NotebookHandler};
pub use queue::{KeyedLocks, WorkQueue};

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::Api;
use kube::core::NamespaceResourceScope;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ClusterClient, KubeClusterClient, KubeSchemaClient, SchemaClient};
use crate::crd::{Notebook, NotebookPhase, NotebookSpec, NotebookStatus};
use crate::pki::CertificateAuthority;
use crate::retry;
use crate::{Error, Result};

use cache::{run_informer, run_resync};
use reconcilers::reconcile_notebook_resources;

const CRD_POLL_INTERVAL: Duration = Duration::from_millis(500);
const CRD_TIMEOUT: Duration = Duration::from_secs(60);
const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Controller configuration.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace to watch; empty watches all namespaces.
    pub namespace: String,
    /// Number of worker tasks consuming the queue.
    pub workers: usize,
    /// Interval between synthetic resyncs of every cached object; zero
    /// disables resync.
    pub resync_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            workers: 4,
            resync_interval: Duration::from_secs(300),
        }
    }
}

/// Convergence logic for a single notebook key.
///
/// Reads come from the informer caches, mutations go through the injected
/// [`ClusterClient`]; tests run this against mocks with hand-seeded
/// caches.
pub struct NotebookReconciler {
    client: Arc<dyn ClusterClient>,
    caches: Caches,
    ca: Arc<CertificateAuthority>,
}

impl NotebookReconciler {
    /// Create a reconciler over the given client, caches, and CA.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        caches: Caches,
        ca: Arc<CertificateAuthority>,
    ) -> Self {
        Self { client, caches, ca }
    }

    /// Reconcile one notebook key end to end.
    pub async fn sync(&self, key: &str, stop: &CancellationToken) -> Result<()> {
        debug!(notebook = %key, "syncing notebook");
        let (namespace, name) = split_key(key)?;

        let Some(stored) = self.caches.notebooks.get(key) else {
            info!(notebook = %key, "notebook has been deleted");
            // Owner references let the garbage collector clean up
            // eventually; the synthetic delete pass does it now and also
            // covers dependents whose reference was lost.
            let mut tombstone = Notebook::new(name, NotebookSpec::default());
            tombstone.metadata.namespace = Some(namespace.to_string());
            tombstone.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            return reconcile_notebook_resources(
                self.client.as_ref(),
                &self.caches,
                &self.ca,
                &tombstone,
                stop,
            )
            .await;
        };

        let mut notebook = (*stored).clone();

        if let Err(err) = notebook.spec.validate() {
            if let Err(phase_err) = self.set_phase(&mut notebook, NotebookPhase::Failed).await {
                warn!(notebook = %key, error = %phase_err, "failed to set notebook phase");
            }
            return Err(err);
        }

        notebook.spec.set_defaults();
        if notebook.spec != stored.spec {
            debug!(notebook = %key, "writing back defaulted spec");
            // The write triggers another watch event and with it the
            // next reconcile of this key.
            return self.client.update_notebook(&notebook).await;
        }

        if notebook.phase() != NotebookPhase::Running
            && notebook.phase() != NotebookPhase::Failed
        {
            if let Err(err) = self.set_phase(&mut notebook, NotebookPhase::Pending).await {
                warn!(notebook = %key, error = %err, "failed to set notebook phase");
            }
        }

        if let Err(err) = reconcile_notebook_resources(
            self.client.as_ref(),
            &self.caches,
            &self.ca,
            &notebook,
            stop,
        )
        .await
        {
            if let Err(phase_err) = self.set_phase(&mut notebook, NotebookPhase::Failed).await {
                warn!(notebook = %key, error = %phase_err, "failed to set notebook phase");
            }
            return Err(err);
        }

        if let Err(err) = self.set_phase(&mut notebook, NotebookPhase::Running).await {
            warn!(notebook = %key, error = %err, "failed to set notebook phase");
        }
        Ok(())
    }

    async fn set_phase(&self, notebook: &mut Notebook, phase: NotebookPhase) -> Result<()> {
        if notebook.phase() == phase {
            return Ok(());
        }
        notebook.status = Some(NotebookStatus { phase });
        info!(notebook = %object_key(notebook), ?phase, "setting notebook phase");
        self.client.update_notebook_status(notebook).await
    }
}

/// Split a work key into namespace and name.
fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/')
        .ok_or_else(|| Error::reconcile(format!("unexpected key format {key:?}")))
}

/// Worker loop: pull keys, serialize per key, sync, and classify the
/// outcome for the queue.
async fn run_worker(
    id: usize,
    reconciler: Arc<NotebookReconciler>,
    queue: Arc<WorkQueue>,
    locks: KeyedLocks,
    stop: CancellationToken,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let result = {
            let lock = locks.lock_for(&key);
            let _guard = lock.lock().await;
            AssertUnwindSafe(reconciler.sync(&key, &stop))
                .catch_unwind()
                .await
        };
        queue.done(&key);
        match result {
            Ok(Ok(())) => queue.forget(&key),
            Ok(Err(err @ Error::Validation(_))) => {
                // An invalid spec only changes through a user edit;
                // re-queuing would spin until then.
                error!(notebook = %key, error = %err, "notebook spec rejected");
                queue.forget(&key);
            }
            Ok(Err(err)) => {
                error!(notebook = %key, error = %err, "failed to sync notebook");
                Arc::clone(&queue).add_rate_limited(&key);
            }
            Err(_) => {
                error!(notebook = %key, "sync panicked");
                Arc::clone(&queue).add_rate_limited(&key);
            }
        }
    }
    debug!(worker = id, "worker stopped");
}

/// Register the Notebook CRD and wait for it to be established.
async fn init_crd(schema: &Arc<dyn SchemaClient>, stop: &CancellationToken) -> Result<()> {
    info!("initializing custom resource definition");

    let bounded = retry::deadline(stop, CRD_TIMEOUT);
    let create_schema = Arc::clone(schema);
    let messages = retry::retry(CRD_POLL_INTERVAL, bounded, move || {
        let schema = Arc::clone(&create_schema);
        async move {
            match schema.create_notebook_crd().await {
                Ok(()) => Ok(()),
                Err(err) if err.is_already_exists() => {
                    info!("custom resource definition already exists");
                    Ok(())
                }
                Err(err) => {
                    warn!(error = %err, "unable to create custom resource definition");
                    Err(err)
                }
            }
        }
    });
    drain_retry(messages, "failed creating custom resource definition").await?;

    let bounded = retry::deadline(stop, CRD_TIMEOUT);
    let poll_schema = Arc::clone(schema);
    let messages = retry::retry(CRD_POLL_INTERVAL, bounded, move || {
        let schema = Arc::clone(&poll_schema);
        async move {
            let crd = schema.get_notebook_crd().await.map_err(|err| {
                warn!(error = %err, "failed to get custom resource definition");
                err
            })?;
            if crd_established(&crd) {
                Ok(())
            } else {
                Err(Error::wait("custom resource definition is not yet established"))
            }
        }
    });
    drain_retry(messages, "failed waiting for custom resource definition").await?;

    info!("custom resource definition is ready");
    Ok(())
}

fn crd_established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Established" && condition.status == "True")
        })
}

async fn drain_retry(
    mut messages: tokio::sync::mpsc::Receiver<retry::Message<Error>>,
    context: &str,
) -> Result<()> {
    while let Some(message) = messages.recv().await {
        if message.done {
            return match message.error {
                None => Ok(()),
                Some(err) => Err(Error::bootstrap(format!("{context}: {err}"))),
            };
        }
    }
    Err(Error::bootstrap(context.to_string()))
}

/// The notebook controller: informers, dispatcher, queue, and workers.
pub struct Controller {
    config: ControllerConfig,
    kube: Client,
    schema: Arc<dyn SchemaClient>,
    reconciler: Arc<NotebookReconciler>,
    caches: Caches,
    queue: Arc<WorkQueue>,
    locks: KeyedLocks,
}

impl Controller {
    /// Create a controller over the given kube client, CA, and config.
    pub fn new(client: Client, ca: CertificateAuthority, config: ControllerConfig) -> Self {
        let caches = Caches::new();
        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
        let schema: Arc<dyn SchemaClient> = Arc::new(KubeSchemaClient::new(client.clone()));
        let reconciler = Arc::new(NotebookReconciler::new(
            cluster,
            caches.clone(),
            Arc::new(ca),
        ));
        Self {
            config,
            kube: client,
            schema,
            reconciler,
            caches,
            queue: Arc::new(WorkQueue::new()),
            locks: KeyedLocks::new(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        if self.config.namespace.is_empty() {
            Api::all(self.kube.clone())
        } else {
            Api::namespaced(self.kube.clone(), &self.config.namespace)
        }
    }

    /// Run the controller until the stop token fires.
    ///
    /// Fails fast when the CRD cannot be registered or the caches never
    /// sync; after startup, errors stay inside the reconcile loop.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        init_crd(&self.schema, &stop).await.map_err(|err| {
            error!(error = %err, "failed to initialize custom resource definition");
            err
        })?;

        let notebook_handler: Arc<dyn EventHandler<Notebook>> =
            Arc::new(NotebookHandler::new(Arc::clone(&self.queue)));
        let dependent_handler = Arc::new(DependentHandler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.caches.notebooks),
        ));
        let service_handler: Arc<dyn EventHandler<Service>> = dependent_handler.clone();
        let secret_handler: Arc<dyn EventHandler<Secret>> = dependent_handler.clone();
        let stateful_set_handler: Arc<dyn EventHandler<StatefulSet>> = dependent_handler.clone();
        let ingress_handler: Arc<dyn EventHandler<Ingress>> = dependent_handler.clone();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_informer(
            self.api::<Notebook>(),
            Arc::clone(&self.caches.notebooks),
            Arc::clone(&notebook_handler),
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_informer(
            self.api::<Service>(),
            Arc::clone(&self.caches.services),
            Arc::clone(&service_handler),
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_informer(
            self.api::<Secret>(),
            Arc::clone(&self.caches.secrets),
            Arc::clone(&secret_handler),
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_informer(
            self.api::<StatefulSet>(),
            Arc::clone(&self.caches.stateful_sets),
            Arc::clone(&stateful_set_handler),
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_informer(
            self.api::<Ingress>(),
            Arc::clone(&self.caches.ingresses),
            Arc::clone(&ingress_handler),
            stop.child_token(),
        )));

        let resync = self.config.resync_interval;
        tasks.push(tokio::spawn(run_resync(
            Arc::clone(&self.caches.notebooks),
            notebook_handler,
            resync,
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_resync(
            Arc::clone(&self.caches.services),
            service_handler,
            resync,
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_resync(
            Arc::clone(&self.caches.secrets),
            secret_handler,
            resync,
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_resync(
            Arc::clone(&self.caches.stateful_sets),
            stateful_set_handler,
            resync,
            stop.child_token(),
        )));
        tasks.push(tokio::spawn(run_resync(
            Arc::clone(&self.caches.ingresses),
            ingress_handler,
            resync,
            stop.child_token(),
        )));

        self.wait_for_cache_sync(&stop).await?;
        info!("successfully synced all caches");

        for id in 0..self.config.workers.max(1) {
            tasks.push(tokio::spawn(run_worker(
                id,
                Arc::clone(&self.reconciler),
                Arc::clone(&self.queue),
                self.locks.clone(),
                stop.child_token(),
            )));
        }
        info!(workers = self.config.workers.max(1), "notebook controller running");

        stop.cancelled().await;
        self.queue.shut_down();
        for task in tasks {
            let _ = task.await;
        }
        info!("notebook controller stopped");
        Ok(())
    }

    async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> Result<()> {
        while !self.caches.all_synced() {
            if stop.is_cancelled() {
                return Err(Error::bootstrap("failed to sync caches"));
            }
            tokio::time::sleep(CACHE_SYNC_POLL).await;
        }
        Ok(())
    }
}
