//! Container identity as seen by the tracer.

use std::{
    collections::BTreeMap,
    fmt,
    net::IpAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};

/// Stable runtime identifier of a container (the 64-hex runtime id on k8s).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Kernel namespace inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceId(pub u64);

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A container running on this node.
///
/// Immutable once registered; only the liveness flag flips when the
/// runtime reports the container stopped.
#[derive(Debug, Serialize)]
pub struct Container {
    pub id: ContainerId,
    pub mount_ns: NamespaceId,
    pub net_ns: NamespaceId,
    pub pod_name: String,
    pub pod_namespace: String,
    pub labels: BTreeMap<String, String>,
    pub ip_addresses: Vec<IpAddr>,
    #[serde(skip)]
    alive: AtomicBool,
}

impl Container {
    pub fn new(id: impl Into<ContainerId>, mount_ns: u64, net_ns: u64) -> Self {
        Self {
            id: id.into(),
            mount_ns: NamespaceId(mount_ns),
            net_ns: NamespaceId(net_ns),
            pod_name: String::new(),
            pod_namespace: String::new(),
            labels: BTreeMap::new(),
            ip_addresses: Vec::new(),
            alive: AtomicBool::new(true),
        }
    }

    pub fn with_pod(mut self, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.pod_name = name.into();
        self.pod_namespace = namespace.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip_addresses.push(ip);
        self
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_stopped(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Same identity and metadata, ignoring liveness.
    pub fn same_data(&self, other: &Container) -> bool {
        self.id == other.id
            && self.mount_ns == other.mount_ns
            && self.net_ns == other.net_ns
            && self.pod_name == other.pod_name
            && self.pod_namespace == other.pod_namespace
            && self.labels == other.labels
            && self.ip_addresses == other.ip_addresses
    }

    /// True when every selector entry is present in this container's labels.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|own| own == v))
    }
}

impl Clone for Container {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            mount_ns: self.mount_ns,
            net_ns: self.net_ns,
            pod_name: self.pod_name.clone(),
            pod_namespace: self.pod_namespace.clone(),
            labels: self.labels.clone(),
            ip_addresses: self.ip_addresses.clone(),
            alive: AtomicBool::new(self.is_alive()),
        }
    }
}

/// Which containers a session traces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelector {
    /// Exactly these containers; new containers are never added.
    Containers(Vec<ContainerId>),
    /// Every container whose labels include all of these.
    Labels(BTreeMap<String, String>),
    /// Every container on the node.
    All,
}

impl TargetSelector {
    /// Whether a newly started container should join a session with this selector.
    pub fn follows(&self, container: &Container) -> bool {
        match self {
            Self::Containers(_) => false,
            Self::Labels(labels) => container.matches_labels(labels),
            Self::All => true,
        }
    }
}
