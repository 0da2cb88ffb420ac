//! cfgwatch core types: identities, workload shapes, errors and the store seam.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod mem;

/// Discovery cycle id used for mark-and-sweep.
pub type Generation = u64;

/// Namespaced identity of a workload or a configuration object.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `namespace/name`. Without a separator the whole string is the name.
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new("", s),
        }
    }

    /// Parse a dependency annotation value verbatim. A bare name keeps an empty
    /// namespace and so never resolves to an object.
    pub fn from_annotation(value: &str) -> Result<Self, CoreError> {
        let r = Self::parse(value);
        if r.name.is_empty() || r.name.contains('/') || value.contains(char::is_whitespace) {
            return Err(CoreError::MalformedReference(value.to_string()));
        }
        Ok(r)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Workload collections that can depend on a configuration object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 3] = [WorkloadKind::Deployment, WorkloadKind::DaemonSet, WorkloadKind::StatefulSet];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for WorkloadKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deploy" => Ok(WorkloadKind::Deployment),
            "daemonset" | "ds" => Ok(WorkloadKind::DaemonSet),
            "statefulset" | "sts" => Ok(WorkloadKind::StatefulSet),
            _ => Err(CoreError::UnknownKind(s.to_string())),
        }
    }
}

/// A workload asserting a dependency on a configuration object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dependent {
    pub kind: WorkloadKind,
    pub workload: ResourceRef,
}

impl Dependent {
    pub fn new(kind: WorkloadKind, workload: ResourceRef) -> Self { Self { kind, workload } }
}

impl fmt::Display for Dependent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{} {}", self.kind, self.workload) }
}

/// Metadata-only view of a listed workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub id: ResourceRef,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Full workload object as raw JSON, read for a restart and written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub kind: WorkloadKind,
    pub id: ResourceRef,
    pub raw: serde_json::Value,
}

/// Structural content of a configuration object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigContent {
    pub data: BTreeMap<String, String>,
    pub binary_data: BTreeMap<String, Vec<u8>>,
}

impl ConfigContent {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let data = pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Self { data, binary_data: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("malformed reference: {0:?}")]
    MalformedReference(String),
    #[error("malformed object: {0}")]
    MalformedObject(String),
    #[error("unknown workload kind: {0}")]
    UnknownKind(String),
}

/// Errors surfaced by a [`ResourceStore`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

/// Stream of configuration object states observed by a watch.
pub type ConfigStream = BoxStream<'static, Result<ConfigContent, StoreError>>;

/// The externally owned resource graph.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    /// List workloads of `kind` matching a label selector (`None` = all namespaces).
    async fn list_workloads(&self, kind: WorkloadKind, namespace: Option<&str>, selector: &str) -> Result<Vec<WorkloadSummary>, StoreError>;

    async fn get_workload(&self, kind: WorkloadKind, id: &ResourceRef) -> Result<Workload, StoreError>;

    async fn update_workload(&self, workload: &Workload) -> Result<(), StoreError>;

    async fn get_config(&self, id: &ResourceRef) -> Result<ConfigContent, StoreError>;

    /// Watch exactly one configuration object. Yields its state after every update.
    async fn watch_config(&self, id: &ResourceRef) -> Result<ConfigStream, StoreError>;
}

/// How configuration changes are noticed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// One watch per tracked object.
    Push,
    /// Periodic full-content comparison against a snapshot.
    Diff,
}

pub const DEFAULT_OPT_IN_SELECTOR: &str = "watcher.ibm.com/opt-in=true";
pub const DEFAULT_ANNOTATION: &str = "watcher.ibm.com/configmap-resource";
pub const DEFAULT_RESTART_LABEL: &str = "watcher.ibm.com/restart-time";

/// Runtime configuration of the reconciliation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub gather_every: Duration,
    /// Sweep every N discovery cycles.
    pub clean_every: u64,
    /// When set, only workloads in these namespaces may register a dependency.
    pub allowed_namespaces: Option<BTreeSet<String>>,
    pub strategy: Strategy,
    pub diff_every: Duration,
    pub opt_in_selector: String,
    pub annotation_key: String,
    pub restart_label: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            gather_every: Duration::from_secs(20),
            clean_every: 100,
            allowed_namespaces: None,
            strategy: Strategy::Push,
            diff_every: Duration::from_secs(20),
            opt_in_selector: DEFAULT_OPT_IN_SELECTOR.to_string(),
            annotation_key: DEFAULT_ANNOTATION.to_string(),
            restart_label: DEFAULT_RESTART_LABEL.to_string(),
        }
    }
}

impl WatchConfig {
    pub fn namespace_allowed(&self, ns: &str) -> bool {
        self.allowed_namespaces.as_ref().map(|set| set.contains(ns)).unwrap_or(true)
    }
}
