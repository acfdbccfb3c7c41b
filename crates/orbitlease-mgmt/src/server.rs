use crate::api::AdminApi;
use crate::config::MgmtConfig;
use crate::ingest::{run_lifecycle_sweeps, run_telemetry_ingest};
use crate::inventory::Inventory;
use orbitlease_core::{LeaseService, MemoryKvStore, SystemClock};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builds the service, seeds inventory and runs the API plus background
/// loops until Ctrl+C or until one of them exits.
pub async fn serve(config: MgmtConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let service = Arc::new(LeaseService::new(
        Arc::new(MemoryKvStore::new()),
        Arc::new(SystemClock),
        config.fault_rules.clone(),
    )?);

    if let Some(path) = &config.inventory_path {
        Inventory::from_file(path)?.seed(&service)?;
    } else {
        tracing::warn!("No inventory_path configured, registry starts empty");
    }

    let (telemetry_tx, telemetry_rx) = mpsc::channel(config.telemetry_queue_depth);
    let api = AdminApi::new(service.clone(), telemetry_tx, config.clone());

    let ingest_handle = tokio::spawn(run_telemetry_ingest(service.clone(), telemetry_rx));
    let sweep_handle = tokio::spawn(run_lifecycle_sweeps(
        service.clone(),
        config.lifecycle_interval_secs,
    ));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            tracing::error!("API serve error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        _ = ingest_handle => {
            tracing::warn!("Telemetry ingest loop exited");
        }
        _ = sweep_handle => {
            tracing::warn!("Lifecycle sweep loop exited");
        }
        _ = api_handle => {}
    }

    Ok(())
}
