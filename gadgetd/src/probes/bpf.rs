//! Probe installer backed by the loaded eBPF object.
//!
//! All programs consult a single `MNTNS_FILTER` hash map, so installing a
//! probe for a namespace is an insert and removing it is a delete. Programs
//! are attached once at load time.

use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use aya::{
    Ebpf,
    maps::{HashMap as BpfHashMap, MapData},
};
use aya_log::EbpfLogger;
use gadgetd_common::{EVENTS_MAP, MNTNS_FILTER_MAP, RawEvent};
use log::{info, warn};
use tokio::sync::mpsc;

use crate::container::NamespaceId;
use crate::error::InstallError;
use crate::event::Event;
use crate::probes::{
    InstallToken, ProbeInstaller, TracepointConfig, attach_tracepoint, spawn_ringbuf_handler,
};
use crate::telemetry;

const TRACEPOINTS: [TracepointConfig<'static>; 2] = [
    TracepointConfig {
        program_name: "gadget_sys_exit",
        category: "raw_syscalls",
        name: "sys_exit",
    },
    TracepointConfig {
        program_name: "gadget_inet_sock_set_state",
        category: "sock",
        name: "inet_sock_set_state",
    },
];

pub struct BpfFilterInstaller {
    filter: Mutex<BpfHashMap<MapData, u64, u8>>,
    // Programs detach when the object is dropped.
    _bpf: Mutex<Ebpf>,
}

impl BpfFilterInstaller {
    /// Load the bytecode, attach every available tracepoint and start
    /// forwarding decoded events into `events`.
    pub fn load(bytecode: &[u8], events: mpsc::Sender<Event>) -> Result<Self> {
        let mut bpf = Ebpf::load(bytecode).context("Failed to load probe bytecode")?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        let mut attached = 0;
        for config in TRACEPOINTS {
            if attach_tracepoint(&mut bpf, config)? {
                attached += 1;
            }
        }
        if attached == 0 {
            bail!("None of the tracepoints required by the probes are available");
        }

        let filter: BpfHashMap<MapData, u64, u8> = BpfHashMap::try_from(
            bpf.take_map(MNTNS_FILTER_MAP)
                .with_context(|| format!("Failed to get {} map", MNTNS_FILTER_MAP))?,
        )?;

        spawn_ringbuf_handler(&mut bpf, EVENTS_MAP, move |raw: RawEvent| {
            match Event::from_raw(&raw) {
                Some(event) => {
                    // Only fails once the multiplexer is gone during shutdown.
                    let _ = events.blocking_send(event);
                }
                None => telemetry::record_malformed_event(),
            }
        })?;

        info!("Probe bytecode loaded ({} tracepoints attached)", attached);
        Ok(Self {
            filter: Mutex::new(filter),
            _bpf: Mutex::new(bpf),
        })
    }
}

impl ProbeInstaller for BpfFilterInstaller {
    fn install(&self, namespace: NamespaceId) -> std::result::Result<InstallToken, InstallError> {
        let mut filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
        filter
            .insert(namespace.0, 1u8, 0)
            .map_err(|e| classify(&e))?;
        Ok(InstallToken::new(namespace.0))
    }

    fn uninstall(&self, token: InstallToken) -> std::result::Result<(), InstallError> {
        let mut filter = self.filter.lock().unwrap_or_else(|e| e.into_inner());
        filter.remove(&token.value()).map_err(|e| classify(&e))
    }
}

/// Map a kernel error onto the installer taxonomy by looking for the
/// underlying errno anywhere in the source chain.
fn classify(err: &(dyn std::error::Error + 'static)) -> InstallError {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return match io.raw_os_error() {
                Some(libc::E2BIG | libc::ENOSPC | libc::ENOMEM) => {
                    InstallError::ResourceExhausted(err.to_string())
                }
                Some(libc::EPERM | libc::EACCES) => InstallError::PermissionDenied(err.to_string()),
                _ => InstallError::Other(err.to_string()),
            };
        }
        current = e.source();
    }
    InstallError::Other(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_map_full() {
        let err = std::io::Error::from_raw_os_error(libc::E2BIG);
        assert!(classify(&err).is_exhaustion());
    }

    #[test]
    fn test_classify_permission() {
        let err = std::io::Error::from_raw_os_error(libc::EPERM);
        assert!(matches!(classify(&err), InstallError::PermissionDenied(_)));
    }

    #[test]
    fn test_classify_without_errno() {
        let err = std::fmt::Error;
        assert!(matches!(classify(&err), InstallError::Other(_)));
    }
}
