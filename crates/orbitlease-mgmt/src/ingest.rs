//! Background loops: the single telemetry consumer and the lifecycle sweep.

use orbitlease_core::{LeaseService, SweepReport, TelemetryPoint};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Drains `rx` in arrival order until every sender is dropped. Returns the
/// number of points evaluated.
pub async fn run_telemetry_ingest(
    service: Arc<LeaseService>,
    mut rx: mpsc::Receiver<TelemetryPoint>,
) -> u64 {
    let mut processed = 0;
    while let Some(point) = rx.recv().await {
        processed += 1;
        match service.ingest_telemetry(&point) {
            Ok(Some(outcome)) => {
                for fired in &outcome.fired {
                    tracing::info!(
                        port_id = %point.port_id,
                        rule = %fired.rule,
                        incident_id = %fired.incident_id,
                        at_risk = fired.cascade.at_risk.len(),
                        rescheduled = fired.cascade.rescheduled.len(),
                        "fault rule fired"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(port_id = %point.port_id, "Telemetry ingest error: {}", e);
            }
        }
    }
    tracing::info!(processed, "telemetry channel closed, ingest loop exiting");
    processed
}

/// One lifecycle pass; errors are logged and reported as an empty sweep.
pub fn sweep_once(service: &LeaseService) -> SweepReport {
    match service.advance_lifecycle() {
        Ok(report) => {
            if report != SweepReport::default() {
                tracing::info!(
                    started = report.started,
                    completed = report.completed,
                    failed = report.failed,
                    "lifecycle sweep"
                );
            }
            report
        }
        Err(e) => {
            tracing::error!("Lifecycle sweep error: {}", e);
            SweepReport::default()
        }
    }
}

pub async fn run_lifecycle_sweeps(service: Arc<LeaseService>, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&service);
    }
}
