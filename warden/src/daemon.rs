//! Daemon main loop
//!
//! Builds the runtime, loads the plugin directories, runs the background
//! loops until ctrl-c and shuts plugins down in two phases.

use crate::cli::Cli;
use anyhow::Context;
use std::path::PathBuf;
use warden_host::api::{topics, EventEnvelope, EventPayload};
use warden_host::{EventFilter, Runtime, ScanReport, WatcherConfig};

/// Run until ctrl-c
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut runtime = Runtime::builder(cli.runtime_config())
        .build()
        .context("Failed to assemble runtime")?;
    journal(&runtime);

    let watcher = if cli.watch {
        Some(
            runtime
                .watch(WatcherConfig::default())
                .await
                .context("Failed to watch plugin directories")?,
        )
    } else {
        let dirs: Vec<PathBuf> = runtime
            .config()
            .plugin_dirs
            .iter()
            .filter(|dir| dir.is_dir())
            .cloned()
            .collect();
        let report = runtime.coordinator.startup_scan(&dirs).await;
        log_report(&report);
        None
    };

    runtime.spawn_background();
    tracing::info!(
        plugins = runtime.registry.len().await,
        watching = watcher.is_some(),
        "wardend running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutdown requested");

    if let Some(watcher) = watcher {
        watcher.shutdown().await;
    }
    let unloaded = runtime.shutdown(cli.shutdown_grace()).await;
    tracing::info!(unloaded = unloaded.len(), "wardend stopped");
    Ok(())
}

/// Log health and rollout events off the publishing path
fn journal(runtime: &Runtime) {
    let filter = EventFilter::topic(topics::HEALTH).with_topic(topics::ROLLOUT);
    runtime
        .events
        .subscribe_async(filter, |event: &mut EventEnvelope| {
            match &event.payload {
                EventPayload::Health(_) => tracing::debug!(
                    plugin = ?event.plugin_id,
                    kind = %event.event_type,
                    "Health event"
                ),
                payload => tracing::info!(
                    topic = %event.topic,
                    plugin = ?event.plugin_id,
                    version = ?event.version,
                    kind = %event.event_type,
                    payload = ?payload,
                    "Plugin event"
                ),
            }
            Ok(())
        });
}

fn log_report(report: &ScanReport) {
    for (id, reason) in &report.failed {
        tracing::warn!(plugin = %id, reason = %reason, "Plugin failed to load at startup");
    }
    if report.is_clean() {
        tracing::info!(
            loaded = report.loaded.len(),
            started = report.started.len(),
            "All plugins loaded"
        );
    }
}
