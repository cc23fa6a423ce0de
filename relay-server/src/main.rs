//! Relay server bootstrap binary: parses CLI flags, loads configuration,
//! wires the dispatch engine, lease manager, and reverse hub together, binds
//! the two TCP listeners, and installs a Ctrl-C / SIGTERM shutdown path.
//! Modeled on `devolutions-gateway/src/main.rs`'s `run()` minus the
//! Windows-service machinery, which has no analogue here.

#[macro_use]
extern crate tracing;

mod config;
mod identity;
mod listener;
mod net;
mod reverse;

use std::sync::Arc;

use anyhow::Context as _;
use lease_manager::LeaseManagerTask;
use relay_engine::{RelayEngine, RelayEngineConfig};
use relay_identity::Identity;
use relay_log::StaticLogConfig;
use relay_task::{ShutdownHandle, spawn_task};
use reverse_hub::ReverseHub;

struct RelayServerLogConfig;

impl StaticLogConfig for RelayServerLogConfig {
    const MAX_BYTES_PER_LOG_FILE: u64 = 10 * 1024 * 1024;
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "relay-core";
}

fn main() -> anyhow::Result<()> {
    // Extract and remove --config-path before anything else reads the environment.
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut remaining = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--config-path" {
            config_path = Some(args.next().context("missing value for --config-path")?);
        } else {
            remaining.push(arg);
        }
    }

    if let Some(path) = config_path {
        // SAFETY: no other thread exists yet at this point in `main`.
        unsafe { std::env::set_var("RELAY_CONFIG_PATH", &path) };
    }

    if remaining.first().map(String::as_str) == Some("--help") {
        println!("relay-server [--config-path PATH]");
        return Ok(());
    }

    let conf_handle = config::ConfHandle::init().context("failed to load configuration")?;
    let conf = conf_handle.get_conf();

    let _logger_guard = relay_log::init::<RelayServerLogConfig>(&config::get_data_dir(), &conf.log_level, None).context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    runtime.block_on(run(conf_handle))
}

async fn run(conf_handle: config::ConfHandle) -> anyhow::Result<()> {
    let conf = conf_handle.get_conf();

    let credential = identity::load_or_generate(&config::identity_key_path()).context("failed to load relay identity")?;
    info!(identity = %credential.id(), "Relay identity ready");

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

    let reverse_hub_deletion_target: Arc<std::sync::OnceLock<Arc<ReverseHub>>> = Arc::new(std::sync::OnceLock::new());
    let deletion_target = reverse_hub_deletion_target.clone();
    let deletion_callback: lease_manager::DeletionCallback = Arc::new(move |identity: Identity| {
        let deletion_target = deletion_target.clone();
        Box::pin(async move {
            if let Some(reverse_hub) = deletion_target.get() {
                reverse_hub.drop_lease(&identity).await;
            }
        })
    });

    let lease_manager_task = LeaseManagerTask::with_tick_interval(Some(deletion_callback), conf.lease_tick_interval);
    let lease_manager = lease_manager_task.handle();
    lease_manager.set_name_pattern(conf.name_pattern.clone()).await.ok();
    lease_manager.set_ttl_bounds(conf.ttl_bounds).await.ok();
    let _lease_manager_task_handle = spawn_task(lease_manager_task, shutdown_signal.clone());

    let authorizer_lease_manager = lease_manager.clone();
    let authorizer: reverse_hub::Authorizer = Arc::new(move |identity: Identity, token: String| {
        let lease_manager = authorizer_lease_manager.clone();
        Box::pin(async move {
            match lease_manager.get_by_identity(identity).await {
                Ok(Some(entry)) => relay_identity::constant_time_eq(entry.lease.reverse_token.as_bytes(), token.as_bytes()),
                _ => false,
            }
        })
    });

    let reverse_hub = Arc::new(
        ReverseHub::builder(authorizer)
            .capacity(conf.reverse_pool_capacity)
            .keepalive_interval(conf.reverse_keepalive_interval)
            .auth_failure_throttle(conf.auth_failure_throttle)
            .build(),
    );
    let _ = reverse_hub_deletion_target.set(reverse_hub.clone());

    let engine_config = RelayEngineConfig::builder()
        .identity(credential.id().clone())
        .advertised_addresses(conf.advertised_addresses.clone())
        .global_splice_cap(conf.global_splice_cap)
        .per_lease_splice_cap(conf.per_lease_splice_cap)
        .host_round_trip_timeout(conf.host_round_trip_timeout)
        .reverse_acquire_timeout(conf.reverse_acquire_timeout)
        .build();

    let engine = RelayEngine::new(engine_config, lease_manager, reverse_hub.clone());

    let session_listener = tokio::spawn(listener::run(conf.bind_address, engine.clone(), shutdown_signal.clone()));
    let reverse_listener = tokio::spawn(reverse::run(conf.reverse_bind_address, reverse_hub, shutdown_signal.clone()));

    wait_for_shutdown_request().await;
    info!("Shutdown requested");

    shutdown_handle.signal();
    let _ = session_listener.await;
    let _ = reverse_listener.await;
    engine.stop().await;

    info!("Relay server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_request() {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_request() {
    let _ = tokio::signal::ctrl_c().await;
}
