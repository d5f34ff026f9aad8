//! Injected cluster API surface
//!
//! The reconciliation core only ever mutates the cluster through these
//! traits; reads go through the informer caches. The traits exist so the
//! reconcilers can run against a mock in tests while production wires in
//! the real kube client.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, CustomResourceExt, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::Notebook;
use crate::Error;

/// Typed mutation surface over the five object kinds the operator manages.
///
/// Get/list are deliberately absent: reconcilers read from the informer
/// caches, never from the API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create a service.
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;
    /// Replace an existing service.
    async fn update_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;
    /// Delete a service by name.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a secret.
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;
    /// Replace an existing secret.
    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;
    /// Delete a secret by name.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create a stateful set.
    async fn create_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), Error>;
    /// Replace an existing stateful set.
    async fn update_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), Error>;
    /// Delete a stateful set by name.
    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), Error>;
    /// Delete a stateful set by name with foreground propagation, so its
    /// pods are gone before the delete completes.
    async fn delete_stateful_set_foreground(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error>;

    /// Create an ingress.
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error>;
    /// Replace an existing ingress.
    async fn update_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error>;
    /// Delete an ingress by name.
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Replace a notebook, used to write back defaulted specs.
    async fn update_notebook(&self, notebook: &Notebook) -> Result<(), Error>;
    /// Replace a notebook's status subresource. A stale resourceVersion
    /// surfaces as a conflict error and causes a re-queue.
    async fn update_notebook_status(&self, notebook: &Notebook) -> Result<(), Error>;
}

/// Schema-registration surface for the CRD bootstrap.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SchemaClient: Send + Sync {
    /// Register the Notebook CRD with the cluster.
    async fn create_notebook_crd(&self) -> Result<(), Error>;
    /// Fetch the Notebook CRD, including its status conditions.
    async fn get_notebook_crd(&self) -> Result<CustomResourceDefinition, Error>;
}

/// Real Kubernetes implementation of [`ClusterClient`].
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new client wrapping the given kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn stateful_sets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn notebooks(&self, namespace: &str) -> Api<Notebook> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn object_name<K: kube::Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        self.services(namespace)
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn update_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        self.services(namespace)
            .replace(&object_name(service), &PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        self.secrets(namespace)
            .replace(&object_name(secret), &PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn create_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), Error> {
        self.stateful_sets(namespace)
            .create(&PostParams::default(), stateful_set)
            .await?;
        Ok(())
    }

    async fn update_stateful_set(
        &self,
        namespace: &str,
        stateful_set: &StatefulSet,
    ) -> Result<(), Error> {
        self.stateful_sets(namespace)
            .replace(
                &object_name(stateful_set),
                &PostParams::default(),
                stateful_set,
            )
            .await?;
        Ok(())
    }

    async fn delete_stateful_set(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.stateful_sets(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn delete_stateful_set_foreground(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        self.stateful_sets(namespace)
            .delete(name, &DeleteParams::foreground())
            .await?;
        Ok(())
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error> {
        self.ingresses(namespace)
            .create(&PostParams::default(), ingress)
            .await?;
        Ok(())
    }

    async fn update_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<(), Error> {
        self.ingresses(namespace)
            .replace(&object_name(ingress), &PostParams::default(), ingress)
            .await?;
        Ok(())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.ingresses(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn update_notebook(&self, notebook: &Notebook) -> Result<(), Error> {
        let namespace = notebook.namespace().unwrap_or_default();
        self.notebooks(&namespace)
            .replace(&notebook.name_any(), &PostParams::default(), notebook)
            .await?;
        Ok(())
    }

    async fn update_notebook_status(&self, notebook: &Notebook) -> Result<(), Error> {
        let namespace = notebook.namespace().unwrap_or_default();
        let data = serde_json::to_vec(notebook)
            .map_err(|e| Error::serialization(format!("Notebook status: {}", e)))?;
        self.notebooks(&namespace)
            .replace_status(&notebook.name_any(), &PostParams::default(), data)
            .await?;
        Ok(())
    }
}

/// Real Kubernetes implementation of [`SchemaClient`].
pub struct KubeSchemaClient {
    client: Client,
}

impl KubeSchemaClient {
    /// Create a new schema client wrapping the given kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn definitions(&self) -> Api<CustomResourceDefinition> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl SchemaClient for KubeSchemaClient {
    async fn create_notebook_crd(&self) -> Result<(), Error> {
        self.definitions()
            .create(&PostParams::default(), &Notebook::crd())
            .await?;
        Ok(())
    }

    async fn get_notebook_crd(&self) -> Result<CustomResourceDefinition, Error> {
        Ok(self.definitions().get("notebooks.jupyter.squat.ai").await?)
    }
}
