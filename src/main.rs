use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use proxy_coordinator::config::{Cli, ProfileBackend, AUTH_KEY_FILE_ENV};
use proxy_coordinator::manager::{ChildRegistry, SlotManager};
use proxy_coordinator::profiles::{
    discover_profiles, HydrationResult, LocalProfileProvider, ObjectStoreProfileProvider,
    ProfileProvider, S3ObjectStore,
};
use proxy_coordinator::server::{create_router, AppState};
use proxy_coordinator::types::ProfileQueue;
use proxy_coordinator::watchdog::ProcessWatchdog;
use proxy_coordinator::{health, launcher, ports};
use tracing::info;

const STARTUP_READY_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> proxy_coordinator::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Cli::parse();

    let hydration = hydrate(&args)
        .await
        .context("Failed to hydrate auth profiles")?;
    info!(
        profiles_dir = %hydration.profiles_dir.display(),
        key_file = ?hydration.key_file,
        "Hydrated auth material"
    );

    let mut child_env = HashMap::new();
    if let Some(key_file) = &hydration.key_file {
        let key_path = key_file.display().to_string();
        std::env::set_var(AUTH_KEY_FILE_ENV, &key_path);
        child_env.insert(AUTH_KEY_FILE_ENV.to_string(), key_path);
    }

    let profiles = discover_profiles(&hydration.profiles_dir)
        .context("Failed to discover auth profiles")?;
    if profiles.is_empty() {
        bail!(
            "No auth profiles found in {}",
            hydration.profiles_dir.display()
        );
    }

    let port_assignments = ports::assign_ports(
        profiles.len(),
        args.base_api_port,
        args.base_stream_port,
        args.base_debug_port,
        args.port_step,
    )
    .context("Failed to assign child ports")?;

    let launch_config = launcher::LaunchConfig {
        command: args.child_command.clone(),
        env: child_env,
        headless: !args.no_headless,
        log_dir: args.log_dir.clone(),
    };
    let slot_manager = Arc::new(SlotManager::new(
        port_assignments,
        ProfileQueue::new(),
        launch_config,
    ));

    let children = slot_manager
        .bootstrap(&profiles)
        .context("Failed to launch child processes")?;
    info!(count = children.len(), "Launched child process(es)");

    // Startup readiness: a first timeout only demotes; the slot manager is
    // attached afterwards so only the recovery monitor escalates to recycles.
    let registry = ChildRegistry::new(children.iter().cloned());
    for child in &children {
        if health::wait_for_ready(child.clone(), STARTUP_READY_TIMEOUT).await {
            registry.mark_ready(child);
        } else {
            registry.mark_unhealthy(child, "Startup health check failed.");
        }
    }
    let ready_names: Vec<String> = registry
        .ready_children()
        .iter()
        .map(|child| child.name().to_string())
        .collect();
    info!(ready = ?ready_names, "Startup readiness complete");

    registry.set_slot_manager(slot_manager.clone());
    registry.start_monitoring().await;
    let watchdog = ProcessWatchdog::spawn(slot_manager.clone(), registry.clone())
        .context("Failed to start process watchdog")?;

    let state = AppState {
        registry: registry.clone(),
        client: reqwest::Client::builder()
            .build()
            .context("Failed to build outbound HTTP client")?,
    };
    let app = create_router(state);

    let listener =
        tokio::net::TcpListener::bind((args.coordinator_host.as_str(), args.coordinator_port))
            .await
            .with_context(|| {
                format!(
                    "Failed to bind {}:{}",
                    args.coordinator_host, args.coordinator_port
                )
            })?;
    info!(
        "Coordinator listening on http://{}:{}",
        args.coordinator_host, args.coordinator_port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.shutdown().await;
    watchdog.stop();
    slot_manager.shutdown("coordinator shutdown");
    info!("Coordinator shutdown complete.");
    Ok(())
}

async fn hydrate(args: &Cli) -> proxy_coordinator::Result<HydrationResult> {
    let result = match args.profile_backend {
        ProfileBackend::Local => LocalProfileProvider::new(&args.profiles).hydrate().await?,
        ProfileBackend::ObjectStore => {
            let bucket = args
                .auth_profile_bucket
                .clone()
                .context("--auth-profile-bucket is required for the object-store backend")?;
            let store = Arc::new(
                S3ObjectStore::connect(bucket, args.auth_profile_region.clone()).await,
            );
            ObjectStoreProfileProvider::new(
                store,
                args.auth_profile_prefix.as_deref(),
                &args.auth_profile_cache_dir,
            )
            .hydrate()
            .await?
        }
    };
    Ok(result)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
    }
}
