//! cfgwatch kubehub: kube-rs backed [`ResourceStore`].

#![forbid(unsafe_code)]

use std::fmt::{Debug, Display};

use anyhow::{Context, Result};
use cfgwatch_core::{ConfigContent, ConfigStream, ResourceRef, ResourceStore, StoreError, Workload, WorkloadKind, WorkloadSummary};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, ListParams, PostParams},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Workload types carrying a pod template.
trait TemplatedWorkload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl TemplatedWorkload for Deployment {}
impl TemplatedWorkload for DaemonSet {}
impl TemplatedWorkload for StatefulSet {}

fn summary<K: TemplatedWorkload>(obj: &K) -> Option<WorkloadSummary> {
    let meta = obj.meta();
    let id = ResourceRef::new(meta.namespace.clone().unwrap_or_default(), meta.name.clone()?);
    Some(WorkloadSummary {
        id,
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
    })
}

fn content_of(cm: &ConfigMap) -> ConfigContent {
    ConfigContent {
        data: cm.data.clone().unwrap_or_default(),
        binary_data: cm
            .binary_data
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
            .unwrap_or_default(),
    }
}

fn map_err(e: kube::Error, what: impl Display) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what.to_string()),
        other => StoreError::Transient(format!("{}: {}", what, other)),
    }
}

fn decode_err(e: serde_json::Error) -> StoreError { StoreError::Decode(e.to_string()) }

/// A configmap reference without a namespace names nothing.
fn require_namespace(id: &ResourceRef) -> Result<(), StoreError> {
    if id.namespace.is_empty() {
        return Err(StoreError::NotFound(format!("configmap {} (no namespace)", id)));
    }
    Ok(())
}

/// Build a client from kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster)")
}

pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn connect() -> Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    async fn list_typed<K: TemplatedWorkload>(&self, namespace: Option<&str>, selector: &str) -> Result<Vec<WorkloadSummary>, StoreError> {
        let api: Api<K> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(selector);
        }
        let list = api.list(&lp).await.map_err(|e| map_err(e, format!("list {}", K::kind(&()))))?;
        debug!(kind = %K::kind(&()), count = list.items.len(), "listed workloads");
        Ok(list.items.iter().filter_map(summary).collect())
    }

    async fn get_typed<K: TemplatedWorkload>(&self, kind: WorkloadKind, id: &ResourceRef) -> Result<Workload, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &id.namespace);
        let obj = api.get(&id.name).await.map_err(|e| map_err(e, format!("{} {}", kind, id)))?;
        let raw = serde_json::to_value(&obj).map_err(decode_err)?;
        Ok(Workload { kind, id: id.clone(), raw })
    }

    async fn replace_typed<K: TemplatedWorkload>(&self, workload: &Workload) -> Result<(), StoreError> {
        let obj: K = serde_json::from_value(workload.raw.clone()).map_err(decode_err)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &workload.id.namespace);
        api.replace(&workload.id.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(e, format!("{} {}", workload.kind, workload.id)))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn list_workloads(&self, kind: WorkloadKind, namespace: Option<&str>, selector: &str) -> Result<Vec<WorkloadSummary>, StoreError> {
        match kind {
            WorkloadKind::Deployment => self.list_typed::<Deployment>(namespace, selector).await,
            WorkloadKind::DaemonSet => self.list_typed::<DaemonSet>(namespace, selector).await,
            WorkloadKind::StatefulSet => self.list_typed::<StatefulSet>(namespace, selector).await,
        }
    }

    async fn get_workload(&self, kind: WorkloadKind, id: &ResourceRef) -> Result<Workload, StoreError> {
        match kind {
            WorkloadKind::Deployment => self.get_typed::<Deployment>(kind, id).await,
            WorkloadKind::DaemonSet => self.get_typed::<DaemonSet>(kind, id).await,
            WorkloadKind::StatefulSet => self.get_typed::<StatefulSet>(kind, id).await,
        }
    }

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError> {
        match workload.kind {
            WorkloadKind::Deployment => self.replace_typed::<Deployment>(workload).await,
            WorkloadKind::DaemonSet => self.replace_typed::<DaemonSet>(workload).await,
            WorkloadKind::StatefulSet => self.replace_typed::<StatefulSet>(workload).await,
        }
    }

    async fn get_config(&self, id: &ResourceRef) -> Result<ConfigContent, StoreError> {
        require_namespace(id)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &id.namespace);
        let cm = api.get(&id.name).await.map_err(|e| map_err(e, format!("configmap {}", id)))?;
        Ok(content_of(&cm))
    }

    async fn watch_config(&self, id: &ResourceRef) -> Result<ConfigStream, StoreError> {
        require_namespace(id)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &id.namespace);
        let cfg = watcher::Config::default().fields(&format!("metadata.name={}", id.name));
        info!(configmap = %id, "configmap watch started");
        let stream = watcher::watcher(api, cfg)
            .default_backoff()
            .map(|ev| {
                let items: Vec<Result<ConfigContent, StoreError>> = match ev {
                    Ok(Event::Applied(cm)) => vec![Ok(content_of(&cm))],
                    Ok(Event::Restarted(list)) => list.iter().map(|cm| Ok(content_of(cm))).collect(),
                    Ok(Event::Deleted(_)) => Vec::new(),
                    Err(e) => vec![Err(StoreError::Transient(e.to_string()))],
                };
                futures::stream::iter(items)
            })
            .flatten();
        Ok(stream.boxed())
    }
}
