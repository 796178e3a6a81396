//! Reference-counted probe filters, one per mount namespace.
//!
//! The outer map is only held long enough to find or create a slot; the
//! install/uninstall itself runs under the slot's own mutex so unrelated
//! namespaces never contend.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, info, warn};

use crate::container::NamespaceId;
use crate::error::{ProbeError, ProbeResult};
use crate::probes::{InstallToken, ProbeInstaller};
use crate::telemetry;

/// Proof that the holder keeps the filter for `namespace` installed.
///
/// Not `Clone`: it is consumed by [`ProbeTable::release`].
#[derive(Debug)]
#[must_use = "dropping a probe handle leaks a reference; pass it to ProbeTable::release"]
pub struct ProbeHandle {
    namespace: NamespaceId,
    serial: u64,
}

impl ProbeHandle {
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }
}

#[derive(Default)]
struct Slot {
    token: Option<InstallToken>,
    live: HashSet<u64>,
    /// Set once the slot has been dropped from the table; a racing acquirer
    /// that still holds it must retry with a fresh slot.
    retired: bool,
}

type SlotRef = Arc<Mutex<Slot>>;

pub struct ProbeTable {
    installer: Arc<dyn ProbeInstaller>,
    slots: Mutex<HashMap<NamespaceId, SlotRef>>,
    next_serial: AtomicU64,
}

impl ProbeTable {
    pub fn new(installer: Arc<dyn ProbeInstaller>) -> Self {
        Self {
            installer,
            slots: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Take a reference on the filter for `namespace`, installing it on first use.
    pub fn acquire(&self, namespace: NamespaceId) -> ProbeResult<ProbeHandle> {
        loop {
            let slot = {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                Arc::clone(slots.entry(namespace).or_default())
            };

            let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
            if state.retired {
                continue;
            }

            if state.token.is_none() {
                match self.installer.install(namespace) {
                    Ok(token) => {
                        info!("Probe installed for mntns {}", namespace);
                        telemetry::record_probe_installed();
                        state.token = Some(token);
                    }
                    Err(source) => {
                        warn!("Probe install failed for mntns {}: {}", namespace, source);
                        if state.live.is_empty() {
                            state.retired = true;
                            self.forget(namespace, &slot);
                        }
                        return Err(ProbeError::AttachFailed { namespace, source });
                    }
                }
            }

            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            state.live.insert(serial);
            debug!(
                "Probe acquired for mntns {} (refcount={})",
                namespace,
                state.live.len()
            );
            return Ok(ProbeHandle { namespace, serial });
        }
    }

    /// Drop a reference, uninstalling the filter when it was the last one.
    pub fn release(&self, handle: ProbeHandle) -> ProbeResult<()> {
        let ProbeHandle { namespace, serial } = handle;
        let not_live = ProbeError::HandleNotLive { namespace, serial };

        let Some(slot) = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&namespace)
            .cloned()
        else {
            return Err(not_live);
        };

        let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
        if state.retired || !state.live.remove(&serial) {
            return Err(not_live);
        }

        debug!(
            "Probe released for mntns {} (refcount={})",
            namespace,
            state.live.len()
        );
        if !state.live.is_empty() {
            return Ok(());
        }

        state.retired = true;
        self.forget(namespace, &slot);
        let Some(token) = state.token.take() else {
            return Ok(());
        };

        telemetry::record_probe_uninstalled();
        match self.installer.uninstall(token) {
            Ok(()) => {
                info!("Probe uninstalled for mntns {}", namespace);
                Ok(())
            }
            Err(source) => {
                warn!("Probe uninstall failed for mntns {}: {}", namespace, source);
                Err(ProbeError::DetachFailed { namespace, source })
            }
        }
    }

    /// Live references on `namespace`; zero when no filter is installed.
    pub fn refcount(&self, namespace: NamespaceId) -> usize {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&namespace)
            .cloned();
        slot.map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).live.len())
            .unwrap_or(0)
    }

    pub fn installed_count(&self) -> usize {
        let slots: Vec<SlotRef> = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        slots
            .iter()
            .filter(|s| {
                s.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .token
                    .is_some()
            })
            .count()
    }

    /// Caller holds the slot's lock; the table lock is never held while
    /// waiting on a slot, so this ordering cannot deadlock.
    fn forget(&self, namespace: NamespaceId, slot: &SlotRef) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(&namespace).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&namespace);
        }
    }
}
