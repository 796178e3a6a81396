//! Authoritative set of containers running on this node.
//!
//! Reads are on the hot path of every trace event, writes only happen on
//! container churn, so everything sits behind a single `RwLock` with derived
//! indices for mount namespace and IP address.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, RwLock},
};

use log::{debug, info};

use crate::container::{Container, ContainerId, NamespaceId, TargetSelector};
use crate::error::{RegistryError, RegistryResult};

#[derive(Default)]
struct RegistryInner {
    containers: HashMap<ContainerId, Arc<Container>>,
    by_mount_ns: HashMap<NamespaceId, Arc<Container>>,
    /// Containers of one pod share an address, so an IP maps to several.
    by_ip: HashMap<IpAddr, Vec<Arc<Container>>>,
}

/// Thread-safe container map keyed by container id.
#[derive(Default)]
pub struct ContainerRegistry {
    inner: RwLock<RegistryInner>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container.
    ///
    /// Re-adding identical data returns the existing entry; conflicting data
    /// under the same id is rejected.
    pub fn add(&self, container: Container) -> RegistryResult<Arc<Container>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = inner.containers.get(&container.id) {
            if existing.same_data(&container) {
                debug!("Container {} re-added with identical data", container.id);
                return Ok(Arc::clone(existing));
            }
            return Err(RegistryError::DuplicateId(container.id));
        }

        if let Some(owner) = inner.by_mount_ns.get(&container.mount_ns) {
            return Err(RegistryError::NamespaceInUse {
                namespace: container.mount_ns,
                owner: owner.id.clone(),
            });
        }

        let container = Arc::new(container);
        inner
            .containers
            .insert(container.id.clone(), Arc::clone(&container));
        inner
            .by_mount_ns
            .insert(container.mount_ns, Arc::clone(&container));
        for ip in &container.ip_addresses {
            inner
                .by_ip
                .entry(*ip)
                .or_default()
                .push(Arc::clone(&container));
        }

        info!(
            "Container added: {} (pod={}/{} mntns={})",
            container.id, container.pod_namespace, container.pod_name, container.mount_ns
        );
        Ok(container)
    }

    /// Remove a container, returning it if it was tracked.
    pub fn remove(&self, id: &ContainerId) -> Option<Arc<Container>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let container = inner.containers.remove(id)?;

        inner.by_mount_ns.remove(&container.mount_ns);
        for ip in &container.ip_addresses {
            if let Some(owners) = inner.by_ip.get_mut(ip) {
                owners.retain(|c| c.id != container.id);
                if owners.is_empty() {
                    inner.by_ip.remove(ip);
                }
            }
        }
        container.mark_stopped();

        info!("Container removed: {}", container.id);
        Some(container)
    }

    pub fn lookup(&self, id: &ContainerId) -> RegistryResult<Arc<Container>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn lookup_by_namespace(&self, ns: NamespaceId) -> RegistryResult<Arc<Container>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_mount_ns
            .get(&ns)
            .cloned()
            .ok_or(RegistryError::NamespaceNotFound(ns))
    }

    pub fn lookup_by_ip(&self, ip: IpAddr) -> Option<Arc<Container>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_ip.get(&ip).and_then(|owners| owners.first().cloned())
    }

    /// Containers matched by a selector, ordered by id.
    ///
    /// Explicit id lists are resolved strictly by the session manager; here
    /// unknown ids are simply skipped.
    pub fn select(&self, selector: &TargetSelector) -> Vec<Arc<Container>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<Arc<Container>> = match selector {
            TargetSelector::Containers(ids) => ids
                .iter()
                .filter_map(|id| inner.containers.get(id).cloned())
                .collect(),
            TargetSelector::Labels(labels) => inner
                .containers
                .values()
                .filter(|c| c.matches_labels(labels))
                .cloned()
                .collect(),
            TargetSelector::All => inner.containers.values().cloned().collect(),
        };
        selected.sort_by(|a, b| a.id.cmp(&b.id));
        selected.dedup_by(|a, b| a.id == b.id);
        selected
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .containers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
