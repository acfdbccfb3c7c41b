//! Reservation status transitions shared by the arbiter, the cascade and the
//! periodic lifecycle sweep.

use serde::Serialize;

use crate::audit::{Actor, AuditAction, AuditRecord, ObjectType};
use crate::reservation::Reservation;
use crate::service::Stores;
use crate::types::{LeaseError, NodeId, ReservationStatus};

/// One status change and how it is recorded.
pub(crate) struct StatusChange {
    pub status: ReservationStatus,
    pub action: AuditAction,
    pub reason: Option<String>,
}

impl StatusChange {
    pub fn new(status: ReservationStatus, action: AuditAction) -> Self {
        Self {
            status,
            action,
            reason: None,
        }
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Writes `current` with the new status and its audit event. Caller holds the node guard.
pub(crate) fn apply(
    stores: &Stores,
    current: &Reservation,
    change: StatusChange,
    actor: &Actor,
) -> Result<Reservation, LeaseError> {
    let mut next = current.clone();
    next.status = change.status;
    next.status_reason = change.reason.clone();
    next.updated_at = stores.clock.now();

    let mut record = AuditRecord::new(
        actor.clone(),
        change.action,
        ObjectType::Reservation,
        next.id.as_str(),
    )
    .before(current)
    .after(&next);
    if let Some(reason) = change.reason {
        record = record.reason(reason);
    }
    stores
        .audit
        .commit(vec![stores.reservations.put_op(&next)?], record)?;
    Ok(next)
}

/// Counts of transitions made by one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Moves reservations along their time-driven lifecycle.
///
/// `ACCEPTED` whose window has begun becomes `IN_PROGRESS`. Once a window
/// has ended, `ACCEPTED`/`IN_PROGRESS` become `COMPLETED` and `AT_RISK`
/// becomes `FAILED` if its port is still faulted, `COMPLETED` otherwise.
pub fn sweep(stores: &Stores) -> Result<SweepReport, LeaseError> {
    let mut report = SweepReport::default();
    for node in stores.registry.list_nodes()? {
        let node_report = stores
            .locks
            .with_node(&node.id, || sweep_node(stores, &node.id))?;
        report.started += node_report.started;
        report.completed += node_report.completed;
        report.failed += node_report.failed;
    }
    if report != SweepReport::default() {
        tracing::info!(
            started = report.started,
            completed = report.completed,
            failed = report.failed,
            "lifecycle sweep applied transitions"
        );
    }
    Ok(report)
}

fn sweep_node(stores: &Stores, node_id: &NodeId) -> Result<SweepReport, LeaseError> {
    let now = stores.clock.now();
    let mut report = SweepReport::default();
    for reservation in stores.reservations.on_node(node_id)? {
        let ended = reservation.end <= now;
        let change = match reservation.status {
            ReservationStatus::Accepted | ReservationStatus::InProgress if ended => {
                report.completed += 1;
                StatusChange::new(ReservationStatus::Completed, AuditAction::ReservationCompleted)
            }
            ReservationStatus::Accepted if reservation.start <= now => {
                report.started += 1;
                StatusChange::new(ReservationStatus::InProgress, AuditAction::ReservationStarted)
            }
            ReservationStatus::AtRisk if ended => {
                let port_faulted = match &reservation.port_id {
                    Some(port_id) => stores.registry.get_port(port_id)?.status.is_faulted(),
                    None => false,
                };
                if port_faulted {
                    report.failed += 1;
                    StatusChange::new(ReservationStatus::Failed, AuditAction::ReservationFailed)
                        .because("Port still faulted at end of window")
                } else {
                    report.completed += 1;
                    StatusChange::new(ReservationStatus::Completed, AuditAction::ReservationCompleted)
                }
            }
            _ => continue,
        };
        apply(stores, &reservation, change, &Actor::System)?;
    }
    Ok(report)
}
