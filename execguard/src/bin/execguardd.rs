use std::{env, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use log::{debug, info, warn};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};

use execguard::{
    ebpf::{
        load::{attach_programs, init_runtime_config, load_bpf},
        projector::EbpfMapProjector,
        pump::{spawn_ring_pump, EventQueue},
    },
    enrich::{run_enricher, LogSink},
    health::{self, PumpHeartbeat, ReadyFlag},
    resolver::{snapshot::SnapshotIndex, Resolver},
    settings::Settings,
    sources::{self, event_channel},
    sysutils::check_bpf_lsm_enabled,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = match env::var("EXECGUARD_DEBUG") {
        Ok(_) => LevelFilter::Debug,
        Err(_) => LevelFilter::Info,
    };
    TermLogger::init(
        log_level,
        ConfigBuilder::new().build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    // The one fatal error class: bad startup configuration.
    let settings = Settings::new().context("configuration error")?;

    // Sysctls inside containers may hide that BPF LSM is enabled, so the
    // check can be skipped in containerized deployments.
    if env::var("EXECGUARD_CHECK_LSM_SKIP").is_err() {
        let sys_lsm_path = Path::new("/sys")
            .join("kernel")
            .join("security")
            .join("lsm");
        check_bpf_lsm_enabled(sys_lsm_path)?;
    }

    std::fs::create_dir_all(&settings.bpf_pin_path)?;
    let mut bpf = load_bpf(&settings.bpf_pin_path)?;
    if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
        // The hook only logs at debug level; running without it is fine.
        warn!("failed to initialize eBPF logger: {e}");
    }
    init_runtime_config(&mut bpf, settings.learning_enabled)?;
    attach_programs(&mut bpf)?;
    debug!("loaded and attached the exec hook");

    let (cancel_tx, cancel_rx) = watch::channel(false);

    // Ring buffers -> bounded queues -> enrichers -> sinks.
    let heartbeat = PumpHeartbeat::new();
    let snapshot = SnapshotIndex::new();

    let monitoring_queue = EventQueue::new(settings.event_channel_capacity);
    spawn_ring_pump(
        &mut bpf,
        "MONITORING_EVENTS",
        monitoring_queue.clone(),
        heartbeat.clone(),
        cancel_rx.clone(),
    )?;
    tokio::spawn(run_enricher(
        monitoring_queue,
        snapshot.clone(),
        Arc::new(LogSink::monitoring()),
        cancel_rx.clone(),
    ));

    if settings.learning_enabled {
        let learning_queue = EventQueue::new(settings.event_channel_capacity);
        spawn_ring_pump(
            &mut bpf,
            "LEARNING_EVENTS",
            learning_queue.clone(),
            heartbeat.clone(),
            cancel_rx.clone(),
        )?;
        tokio::spawn(run_enricher(
            learning_queue,
            snapshot.clone(),
            Arc::new(LogSink::learning()),
            cancel_rx.clone(),
        ));
    }

    // Resolver and its sources.
    let projector = EbpfMapProjector::new(&mut bpf)?;
    let ready = ReadyFlag::new();
    let resolver = Resolver::new(
        projector,
        settings.policy_label_key.clone(),
        Duration::from_secs(settings.projector_retry_max_secs),
        snapshot,
        ready.clone(),
    );
    let (tx, rx) = event_channel();
    let resolver_task = tokio::spawn(resolver.run(rx, cancel_rx.clone()));

    let client = kube::Client::try_default().await?;
    let runtime_source_enabled = !settings.container_runtime_socket.is_empty();
    tokio::spawn(sources::pod::run(
        client.clone(),
        settings.node_name.clone(),
        !runtime_source_enabled,
        tx.clone(),
        cancel_rx.clone(),
    ));
    tokio::spawn(sources::policy::run(client, tx.clone(), cancel_rx.clone()));
    if runtime_source_enabled {
        tokio::spawn(sources::runtime::run(
            settings.container_runtime_socket.clone(),
            tx.clone(),
            cancel_rx.clone(),
        ));
    } else {
        info!("runtime hook source disabled; resolving containers from the pod watch");
    }

    tokio::spawn(health::serve(
        settings.readiness_endpoint.clone(),
        ready,
        heartbeat,
        cancel_rx.clone(),
    ));

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received");

    // Sources stop enqueueing, the resolver drains and tears the kernel
    // state down, the pump threads stop on the next poll.
    drop(tx);
    let _ = cancel_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_GRACE, resolver_task)
        .await
        .is_err()
    {
        warn!("resolver did not finish teardown within the grace period");
    }

    Ok(())
}
