//! StatefulSet builder

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretKeySelector, SecretVolumeSource, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use crate::crd::Notebook;

use super::{
    dependent_meta, match_labels, owner_reference, resource_name, should_have_certs, NOTEBOOK_PORT,
    NOTEBOOK_PORT_NAME, PASSWORD_KEY, TLS_CERT_KEY, TLS_MOUNT_PATH, TLS_PRIVATE_KEY_KEY,
};

const CONTAINER_NAME: &str = "notebook";
const TLS_VOLUME_NAME: &str = "tls";
const GPU_RESOURCE: &str = "nvidia.com/gpu";
// 0644; secret files are readable by the notebook user.
const TLS_FILE_MODE: i32 = 420;

/// Container image for the given notebook.
pub fn notebook_image(notebook: &Notebook) -> String {
    let flavor = notebook.spec.flavor.unwrap_or_default();
    format!("jupyter/{}-notebook:latest", flavor.as_str())
}

/// Build the single-replica StatefulSet running the notebook server.
///
/// The pod template is fully specified, including fields the API server
/// would otherwise default (DNS policy, restart policy, scheduler name),
/// so the reconciler's template comparison against live objects is
/// stable.
pub fn build_stateful_set(notebook: &Notebook) -> StatefulSet {
    let name = notebook.name_any();
    let secret_name = resource_name(&name);

    let mut args = vec![
        "start-notebook.sh".to_string(),
        "--NotebookApp.token=".to_string(),
    ];

    let mut env = None;
    if notebook
        .spec
        .password
        .as_deref()
        .is_some_and(|p| !p.is_empty())
    {
        env = Some(vec![EnvVar {
            name: "PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name.clone(),
                    key: PASSWORD_KEY.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
            value: None,
        }]);
        args.push("--NotebookApp.password=\"$(PASSWORD)\"".to_string());
    }

    let mut volume_mounts = None;
    let volume;
    if should_have_certs(notebook) {
        args.push(format!("--NotebookApp.certfile={TLS_MOUNT_PATH}/cert"));
        args.push(format!("--NotebookApp.keyfile={TLS_MOUNT_PATH}/key"));
        volume_mounts = Some(vec![VolumeMount {
            name: TLS_VOLUME_NAME.to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]);
        volume = Volume {
            name: TLS_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name),
                default_mode: Some(TLS_FILE_MODE),
                items: Some(vec![
                    KeyToPath {
                        key: TLS_CERT_KEY.to_string(),
                        path: "cert".to_string(),
                        mode: None,
                    },
                    KeyToPath {
                        key: TLS_PRIVATE_KEY_KEY.to_string(),
                        path: "key".to_string(),
                        mode: None,
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
    } else {
        volume = Volume {
            name: TLS_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        };
    }

    let mut resources = None;
    let mut tolerations = None;
    if notebook.spec.gpu {
        resources = Some(ResourceRequirements {
            limits: Some(BTreeMap::from([(
                GPU_RESOURCE.to_string(),
                Quantity("1".to_string()),
            )])),
            ..Default::default()
        });
        tolerations = Some(vec![Toleration {
            key: Some(GPU_RESOURCE.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }]);
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(notebook_image(notebook)),
        image_pull_policy: Some("Always".to_string()),
        args: Some(args),
        env,
        ports: Some(vec![ContainerPort {
            name: Some(NOTEBOOK_PORT_NAME.to_string()),
            container_port: NOTEBOOK_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources,
        volume_mounts,
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    };

    let pod_labels = match_labels(notebook);
    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels.clone()),
            owner_references: Some(vec![owner_reference(notebook)]),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            automount_service_account_token: Some(false),
            containers: vec![container],
            dns_policy: Some("ClusterFirst".to_string()),
            restart_policy: Some("Always".to_string()),
            scheduler_name: Some("default-scheduler".to_string()),
            termination_grace_period_seconds: Some(120),
            tolerations,
            volumes: Some(vec![volume]),
            ..Default::default()
        }),
    };

    StatefulSet {
        metadata: dependent_meta(notebook),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(pod_labels),
                ..Default::default()
            },
            service_name: Some(resource_name(&name)),
            template,
            ..Default::default()
        }),
        status: None,
    }
}
