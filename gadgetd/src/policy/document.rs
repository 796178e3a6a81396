//! `networking.k8s.io/v1` NetworkPolicy document.
//!
//! Fields are declared in the order they appear in the serialized manifest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{PeerSelector, PolicyRule, WorkloadTarget};
use crate::event::{Direction, Protocol};

pub const API_VERSION: &str = "networking.k8s.io/v1";
pub const KIND: &str = "NetworkPolicy";
const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicy {
    pub api_version: String,
    pub kind: String,
    pub metadata: PolicyMetadata,
    pub spec: NetworkPolicySpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<EgressRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<IngressRule>,
    pub pod_selector: LabelSelector,
    pub policy_types: Vec<PolicyType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    pub ports: Vec<PolicyPort>,
    pub to: Vec<PolicyPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub from: Vec<PolicyPeer>,
    pub ports: Vec<PolicyPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPort {
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPeer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    pub pod_selector: LabelSelector,
}

impl From<&PeerSelector> for PolicyPeer {
    fn from(peer: &PeerSelector) -> Self {
        Self {
            namespace_selector: peer.namespace.as_ref().map(|ns| LabelSelector {
                match_labels: BTreeMap::from([(NAMESPACE_NAME_LABEL.to_string(), ns.clone())]),
            }),
            pod_selector: LabelSelector {
                match_labels: peer.labels.clone(),
            },
        }
    }
}

impl NetworkPolicy {
    /// Lay `rules` out in the order given. Both policy types are always
    /// listed: ingress stays default-deny for peers that were never observed.
    pub fn from_rules(target: &WorkloadTarget, rules: &[PolicyRule]) -> Self {
        let mut egress = Vec::new();
        let mut ingress = Vec::new();
        for rule in rules {
            let ports = vec![PolicyPort {
                port: rule.port,
                protocol: rule.protocol,
            }];
            let peers = vec![PolicyPeer::from(&rule.peer)];
            match rule.direction {
                Direction::Egress => egress.push(EgressRule { ports, to: peers }),
                Direction::Ingress => ingress.push(IngressRule { from: peers, ports }),
            }
        }

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: PolicyMetadata {
                name: format!("{}-network", target.name),
                namespace: target.namespace.clone(),
            },
            spec: NetworkPolicySpec {
                egress,
                ingress,
                pod_selector: LabelSelector {
                    match_labels: target.selector.clone(),
                },
                policy_types: vec![PolicyType::Ingress, PolicyType::Egress],
            },
        }
    }
}
