pub mod container;
pub mod control;
pub mod error;
pub mod event;
#[cfg(feature = "k8s")]
pub mod k8s;
pub mod lifecycle;
pub mod multiplexer;
pub mod policy;
pub mod probes;
pub mod registry;
pub mod session;
pub mod settings;
pub mod syscalls;
pub mod telemetry;

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};
use tokio::{signal, sync::mpsc};

use crate::control::ControlPlane;
use crate::event::Event;
use crate::lifecycle::{ContainerEvent, LifecycleTracker};
use crate::multiplexer::Multiplexer;
use crate::policy::{KnownWorkloads, PolicySynthesizer};
use crate::probes::{ProbeInstaller, ProbeTable};
use crate::registry::ContainerRegistry;
use crate::session::SessionManager;
use crate::settings::Settings;

const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// Wires the tracer manager together and owns it for the process lifetime.
pub struct GadgetEngine {
    pub settings: Settings,
    registry: Arc<ContainerRegistry>,
    multiplexer: Arc<Multiplexer>,
    sessions: Arc<SessionManager>,
    known: Arc<KnownWorkloads>,
    raw_events: mpsc::Receiver<Event>,
    lifecycle_tx: mpsc::Sender<ContainerEvent>,
    lifecycle_rx: mpsc::Receiver<ContainerEvent>,
}

impl GadgetEngine {
    /// `raw_events` is the receiving end of the channel the installer's
    /// ring buffer reader feeds.
    pub fn new(
        settings: Settings,
        installer: Arc<dyn ProbeInstaller>,
        raw_events: mpsc::Receiver<Event>,
    ) -> Self {
        let registry = Arc::new(ContainerRegistry::new());
        let probes = Arc::new(ProbeTable::new(installer));
        let multiplexer = Arc::new(Multiplexer::new(Arc::clone(&registry)));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&registry),
            probes,
            Arc::clone(&multiplexer),
            settings.multiplexer.session_buffer,
            settings.sessions.degraded_after,
        ));
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(LIFECYCLE_CHANNEL_CAPACITY);

        Self {
            settings,
            registry,
            multiplexer,
            sessions,
            known: Arc::new(KnownWorkloads::new()),
            raw_events,
            lifecycle_tx,
            lifecycle_rx,
        }
    }

    /// Sender for container start/stop notifications.
    pub fn container_events(&self) -> mpsc::Sender<ContainerEvent> {
        self.lifecycle_tx.clone()
    }

    /// Off-node workload identities consulted by policy synthesis.
    pub fn known_workloads(&self) -> Arc<KnownWorkloads> {
        Arc::clone(&self.known)
    }

    pub async fn run(self) -> Result<()> {
        let socket_path = self.settings.control.socket_path.clone();
        let listener = ControlPlane::bind(&socket_path)?;

        let synthesizer = Arc::new(
            PolicySynthesizer::new(Arc::clone(&self.registry))
                .with_resolver(self.known.clone()),
        );
        let control = Arc::new(
            ControlPlane::new(
                Arc::clone(&self.sessions),
                Arc::clone(&self.registry),
                synthesizer,
            )
            .with_max_synthesis_window(self.settings.control.max_synthesis_window_secs),
        );

        let mux_task = tokio::spawn(Arc::clone(&self.multiplexer).run(self.raw_events));
        let tracker = LifecycleTracker::new(Arc::clone(&self.registry), Arc::clone(&self.sessions));
        let lifecycle_task = tokio::spawn(tracker.run(self.lifecycle_rx));
        let control_task = tokio::spawn(control.serve(listener));

        info!("Tracer manager active. Press Ctrl-C to exit.");
        signal::ctrl_c().await?;
        info!("Exiting...");

        control_task.abort();
        self.sessions.shutdown();
        probes::request_shutdown();
        lifecycle_task.abort();
        mux_task.abort();

        let stats = self.multiplexer.stats();
        info!(
            "Events received={} attributed={} unattributed={}",
            stats.received, stats.attributed, stats.unattributed
        );
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!("Failed to remove {}: {}", socket_path.display(), e);
        }
        Ok(())
    }
}

/// eBPF maps live in locked kernel memory.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
