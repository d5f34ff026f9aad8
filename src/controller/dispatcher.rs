//! Event dispatch: informer callbacks to work-queue adds
//!
//! Notebook events enqueue their own key. Dependent events walk the
//! controller owner reference back to the owning notebook, dropping
//! events for objects this operator does not own and spurious resync
//! updates whose resourceVersion did not change.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::Notebook;

use super::cache::{object_key, EventHandler, ObjectCache};
use super::queue::WorkQueue;

/// Handler for Notebook informer events.
pub struct NotebookHandler {
    queue: Arc<WorkQueue>,
}

impl NotebookHandler {
    /// Create a handler feeding the given queue.
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }

    fn enqueue(&self, notebook: &Notebook) {
        let key = object_key(notebook);
        debug!(notebook = %key, "queueing notebook");
        self.queue.add(&key);
    }
}

impl EventHandler<Notebook> for NotebookHandler {
    fn on_add(&self, notebook: &Notebook) {
        info!(notebook = %object_key(notebook), "adding notebook");
        self.enqueue(notebook);
    }

    fn on_update(&self, _old: &Notebook, new: &Notebook) {
        debug!(notebook = %object_key(new), "updating notebook");
        self.enqueue(new);
    }

    fn on_delete(&self, notebook: &Notebook) {
        info!(notebook = %object_key(notebook), "deleting notebook");
        self.enqueue(notebook);
    }
}

/// Handler for dependent-kind informer events (Service, Secret,
/// StatefulSet, Ingress).
pub struct DependentHandler {
    queue: Arc<WorkQueue>,
    notebooks: Arc<ObjectCache<Notebook>>,
}

impl DependentHandler {
    /// Create a handler resolving owners through the given notebook cache.
    pub fn new(queue: Arc<WorkQueue>, notebooks: Arc<ObjectCache<Notebook>>) -> Self {
        Self { queue, notebooks }
    }

    /// Resolve an owner reference to a currently known notebook.
    ///
    /// A reference of the wrong kind, to an unknown notebook, or with a
    /// stale uid resolves to nothing and the event is ignored.
    fn resolve_owner(&self, namespace: &str, reference: &OwnerReference) -> Option<Arc<Notebook>> {
        if reference.kind != Notebook::kind(&()) {
            return None;
        }
        let notebook = self.notebooks.get(&format!("{namespace}/{}", reference.name))?;
        if notebook.meta().uid.as_deref() != Some(reference.uid.as_str()) {
            debug!(
                namespace = %namespace,
                notebook = %reference.name,
                "owner reference uid does not match cached notebook"
            );
            return None;
        }
        Some(notebook)
    }

    fn enqueue_owner(&self, namespace: &str, meta: &ObjectMeta) {
        let Some(reference) = controller_owner(meta) else {
            return;
        };
        if let Some(notebook) = self.resolve_owner(namespace, reference) {
            self.queue.add(&object_key(notebook.as_ref()));
        }
    }
}

/// The controller owner reference of an object, if any.
fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

impl<K> EventHandler<K> for DependentHandler
where
    K: Resource + Send + Sync,
{
    fn on_add(&self, object: &K) {
        // On a controller restart an object can first appear already
        // pending deletion; route it straight to the delete path.
        if object.meta().deletion_timestamp.is_some() {
            self.on_delete(object);
            return;
        }
        debug!(object = %object_key(object), "dependent object added");
        self.enqueue_owner(&object.namespace().unwrap_or_default(), object.meta());
    }

    fn on_update(&self, old: &K, new: &K) {
        if old.meta().resource_version == new.meta().resource_version {
            return;
        }
        let old_reference = controller_owner(old.meta());
        let new_reference = controller_owner(new.meta());
        if old_reference != new_reference {
            // Sync the old owner too so it can recreate what it lost.
            if let Some(reference) = old_reference {
                if let Some(notebook) =
                    self.resolve_owner(&old.namespace().unwrap_or_default(), reference)
                {
                    self.queue.add(&object_key(notebook.as_ref()));
                }
            }
        }
        debug!(object = %object_key(new), "dependent object updated");
        self.enqueue_owner(&new.namespace().unwrap_or_default(), new.meta());
    }

    fn on_delete(&self, object: &K) {
        debug!(object = %object_key(object), "dependent object deleted");
        self.enqueue_owner(&object.namespace().unwrap_or_default(), object.meta());
    }
}
