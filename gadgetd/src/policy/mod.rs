//! Folding observed connections into a minimal network policy.
//!
//! Every tuple's remote endpoint is resolved to a workload identity (node
//! registry first, then any extra resolvers such as the cluster-wide
//! [`KnownWorkloads`] map). Distinct `(peer, port, protocol)` triples become
//! one rule each, kept in a `BTreeSet` so the output order is a pure function
//! of the input set.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::IpAddr,
    sync::{Arc, RwLock},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::event::{ConnectionTuple, Direction, Protocol};
use crate::registry::ContainerRegistry;

pub mod collector;
pub mod document;

pub use collector::ConnectionCollector;
pub use document::NetworkPolicy;

/// Labels stamped by controllers; they differ per rollout and would make
/// selectors match a single revision only.
const GENERATED_LABELS: [&str; 4] = [
    "pod-template-hash",
    "controller-revision-hash",
    "statefulset.kubernetes.io/pod-name",
    "pod-template-generation",
];

/// Namespace and labels of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

impl From<&Container> for WorkloadIdentity {
    fn from(c: &Container) -> Self {
        Self {
            namespace: c.pod_namespace.clone(),
            labels: c.labels.clone(),
        }
    }
}

/// Maps a remote IP address to the workload behind it.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<WorkloadIdentity>;
}

impl PeerResolver for ContainerRegistry {
    fn resolve(&self, ip: IpAddr) -> Option<WorkloadIdentity> {
        self.lookup_by_ip(ip).map(|c| WorkloadIdentity::from(c.as_ref()))
    }
}

/// Off-node workloads seen by the cluster-wide pod watcher.
#[derive(Default)]
pub struct KnownWorkloads {
    by_ip: RwLock<HashMap<IpAddr, WorkloadIdentity>>,
}

impl KnownWorkloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ip: IpAddr, identity: WorkloadIdentity) {
        self.by_ip
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip, identity);
    }

    pub fn remove(&self, ip: &IpAddr) {
        self.by_ip
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ip);
    }

    pub fn len(&self) -> usize {
        self.by_ip.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PeerResolver for KnownWorkloads {
    fn resolve(&self, ip: IpAddr) -> Option<WorkloadIdentity> {
        self.by_ip
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ip)
            .cloned()
    }
}

/// The workload a policy is generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadTarget {
    pub name: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
}

impl WorkloadTarget {
    /// Derive the target from the containers a session traced: the common
    /// namespace, the given selector (or the stable labels of the first
    /// container) and a name taken from the `app` label or the pod name.
    pub fn infer(
        selector: Option<&BTreeMap<String, String>>,
        containers: &[Arc<Container>],
    ) -> Option<Self> {
        let first = containers.first()?;
        let selector = match selector {
            Some(s) if !s.is_empty() => s.clone(),
            _ => stable_labels(&first.labels),
        };
        if selector.is_empty() {
            return None;
        }
        let name = selector
            .get("app")
            .or_else(|| selector.get("app.kubernetes.io/name"))
            .cloned()
            .unwrap_or_else(|| first.pod_name.clone());
        Some(Self {
            name,
            namespace: first.pod_namespace.clone(),
            selector,
        })
    }

    fn contains(&self, container: &Container) -> bool {
        container.pod_namespace == self.namespace && container.matches_labels(&self.selector)
    }
}

/// Peer side of a rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerSelector {
    pub labels: BTreeMap<String, String>,
    /// Set only when the peer lives in another namespace than the target.
    pub namespace: Option<String>,
}

/// One permitted flow. Field order defines rule ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyRule {
    pub direction: Direction,
    pub peer: PeerSelector,
    pub port: u16,
    pub protocol: Protocol,
}

pub struct PolicySynthesizer {
    registry: Arc<ContainerRegistry>,
    resolvers: Vec<Arc<dyn PeerResolver>>,
}

impl PolicySynthesizer {
    pub fn new(registry: Arc<ContainerRegistry>) -> Self {
        Self {
            resolvers: vec![registry.clone() as Arc<dyn PeerResolver>],
            registry,
        }
    }

    /// Consult `resolver` after every resolver added before it.
    pub fn with_resolver(mut self, resolver: Arc<dyn PeerResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    fn resolve_peer(&self, ip: IpAddr) -> Option<WorkloadIdentity> {
        self.resolvers.iter().find_map(|r| r.resolve(ip))
    }

    /// Deduplicated, ordered rules for `target`.
    ///
    /// Tuples whose local side is not part of the target, or whose peer
    /// cannot be attributed to a labelled workload, are discarded.
    pub fn rules<'a, I>(&self, target: &WorkloadTarget, tuples: I) -> Vec<PolicyRule>
    where
        I: IntoIterator<Item = &'a ConnectionTuple>,
    {
        let mut rules = BTreeSet::new();
        for tuple in tuples {
            let local_matches = self
                .registry
                .lookup_by_namespace(tuple.source_ns)
                .is_ok_and(|c| target.contains(&c));
            if !local_matches {
                debug!("Discarding tuple from mntns {}: not the target", tuple.source_ns);
                continue;
            }

            let Some(peer) = self.resolve_peer(tuple.destination_ip) else {
                debug!("Discarding tuple: peer {} unresolved", tuple.destination_ip);
                continue;
            };
            let labels = stable_labels(&peer.labels);
            if labels.is_empty() {
                continue;
            }

            rules.insert(PolicyRule {
                direction: tuple.direction,
                peer: PeerSelector {
                    labels,
                    namespace: (peer.namespace != target.namespace).then_some(peer.namespace),
                },
                port: tuple.destination_port,
                protocol: tuple.protocol,
            });
        }
        rules.into_iter().collect()
    }

    pub fn synthesize<'a, I>(&self, target: &WorkloadTarget, tuples: I) -> NetworkPolicy
    where
        I: IntoIterator<Item = &'a ConnectionTuple>,
    {
        let rules = self.rules(target, tuples);
        NetworkPolicy::from_rules(target, &rules)
    }
}

fn stable_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| !GENERATED_LABELS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
