use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use gadgetd::{
    GadgetEngine, bump_memlock_rlimit, probes::bpf::BpfFilterInstaller, settings::Settings,
    telemetry,
};
use log::info;
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[clap(version, about = "Per-node container tracer manager")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// Control socket path (overrides settings)
    #[clap(long, env = "GADGETD_SOCKET")]
    socket: Option<PathBuf>,

    /// Compiled probe object (overrides settings)
    #[clap(long, env = "GADGETD_BYTECODE")]
    bytecode: Option<PathBuf>,

    /// Do not watch Kubernetes for containers
    #[clap(long)]
    no_k8s: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let mut settings = Settings::new().context("Failed to load settings")?;
    if let Some(socket) = opt.socket {
        settings.control.socket_path = socket;
    }
    if let Some(bytecode) = opt.bytecode {
        settings.bytecode_path = bytecode;
    }

    telemetry::init_metrics(settings.otel_exporter_otlp_endpoint.as_deref())?;
    bump_memlock_rlimit()?;

    let bytecode = std::fs::read(&settings.bytecode_path).with_context(|| {
        format!(
            "Failed to read probe bytecode {}",
            settings.bytecode_path.display()
        )
    })?;
    let (raw_tx, raw_rx) = mpsc::channel(settings.multiplexer.channel_capacity);
    let installer = Arc::new(BpfFilterInstaller::load(&bytecode, raw_tx)?);

    let engine = GadgetEngine::new(settings, installer, raw_rx);

    if opt.no_k8s {
        info!("Kubernetes container source disabled");
    } else {
        start_container_source(&engine).await;
    }

    engine.run().await?;
    telemetry::shutdown_metrics();
    Ok(())
}

#[cfg(feature = "k8s")]
async fn start_container_source(engine: &GadgetEngine) {
    use gadgetd::k8s;
    use log::warn;

    let Some(node_name) = engine.settings.node_name.clone() else {
        warn!("node_name not set; Kubernetes container source disabled");
        return;
    };
    let client = match k8s::client().await {
        Ok(client) => client,
        Err(e) => {
            warn!("{:#}", e);
            return;
        }
    };

    let watcher = k8s::PodWatcher::new(node_name, engine.container_events());
    if let Err(e) = watcher.start(client.clone()).await {
        warn!("Failed to start pod watcher: {:#}", e);
    }
    if let Err(e) = k8s::start_workload_watcher(client, engine.known_workloads()).await {
        warn!("Failed to start workload watcher: {:#}", e);
    }
}

#[cfg(not(feature = "k8s"))]
async fn start_container_source(_engine: &GadgetEngine) {
    info!("Built without Kubernetes support; no container source");
}
