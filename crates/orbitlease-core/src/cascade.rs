//! Cascading impact of a port incident on the reservations booked on it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{Actor, AuditAction, AuditRecord, ObjectType};
use crate::lifecycle::{self, StatusChange};
use crate::reservation::Reservation;
use crate::service::Stores;
use crate::types::{IncidentId, LeaseError, PortId, PriorityTier, ReservationId, ReservationStatus};

/// How far ahead an auto-rescheduled replacement starts.
const RESCHEDULE_DELAY_HOURS: i64 = 24;

pub const RESCHEDULE_REASON: &str = "Auto-rescheduled due to port incident";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeOutcome {
    pub at_risk: Vec<ReservationId>,
    /// `(cancelled, replacement)` pairs.
    pub rescheduled: Vec<(ReservationId, ReservationId)>,
}

impl CascadeOutcome {
    pub fn is_empty(&self) -> bool {
        self.at_risk.is_empty() && self.rescheduled.is_empty()
    }
}

fn endangered(r: &Reservation, now: DateTime<Utc>) -> bool {
    matches!(
        r.status,
        ReservationStatus::Accepted | ReservationStatus::InProgress
    ) && r.is_current_or_upcoming(now)
}

fn reschedulable(r: &Reservation) -> bool {
    r.status == ReservationStatus::AtRisk
        && r.preemptible
        && matches!(r.priority, PriorityTier::P2 | PriorityTier::P3)
}

/// Reservations on `port` the cascade would touch if it ran at `now`.
pub(crate) fn affected(
    stores: &Stores,
    port: &PortId,
    now: DateTime<Utc>,
) -> Result<Vec<ReservationId>, LeaseError> {
    Ok(stores
        .reservations
        .on_port(port)?
        .into_iter()
        .filter(|r| endangered(r, now) || reschedulable(r))
        .map(|r| r.id)
        .collect())
}

/// Marks current and upcoming reservations on `port` at risk, then
/// reschedules the preemptible P2/P3 ones a day later. Caller holds the node guard.
pub(crate) fn run(
    stores: &Stores,
    port: &PortId,
    incident: &IncidentId,
) -> Result<CascadeOutcome, LeaseError> {
    let now = stores.clock.now();
    let mut outcome = CascadeOutcome::default();

    for reservation in stores.reservations.on_port(port)? {
        if !endangered(&reservation, now) {
            continue;
        }
        lifecycle::apply(
            stores,
            &reservation,
            StatusChange::new(ReservationStatus::AtRisk, AuditAction::ReservationAtRisk)
                .because(format!("Incident {} on port {}", incident, port)),
            &Actor::System,
        )?;
        outcome.at_risk.push(reservation.id);
    }

    for reservation in stores.reservations.on_port(port)? {
        if !reschedulable(&reservation) {
            continue;
        }
        let replacement = reschedule(stores, &reservation, now)?;
        outcome.rescheduled.push((reservation.id, replacement));
    }

    if !outcome.is_empty() {
        tracing::info!(
            port_id = %port,
            incident_id = %incident,
            at_risk = outcome.at_risk.len(),
            rescheduled = outcome.rescheduled.len(),
            "cascade applied"
        );
    }
    Ok(outcome)
}

/// Cancels `original` and books a `REQUESTED` copy starting a day from `now`.
fn reschedule(
    stores: &Stores,
    original: &Reservation,
    now: DateTime<Utc>,
) -> Result<ReservationId, LeaseError> {
    let start = now + Duration::hours(RESCHEDULE_DELAY_HOURS);
    let replacement = Reservation {
        id: ReservationId::generate(),
        start,
        end: start + original.duration(),
        status: ReservationStatus::Requested,
        status_reason: None,
        created_at: now,
        updated_at: now,
        rescheduled_from: Some(original.id.clone()),
        rescheduled_to: None,
        ..original.clone()
    };

    let mut cancelled = original.clone();
    cancelled.status = ReservationStatus::Cancelled;
    cancelled.status_reason = Some(RESCHEDULE_REASON.to_string());
    cancelled.rescheduled_to = Some(replacement.id.clone());
    cancelled.updated_at = now;

    let link = format!("{} -> {}", original.id, replacement.id);
    stores.audit.commit_all(
        vec![
            stores.reservations.put_op(&cancelled)?,
            stores.reservations.put_op(&replacement)?,
        ],
        vec![
            AuditRecord::new(
                Actor::System,
                AuditAction::ReservationRescheduled,
                ObjectType::Reservation,
                original.id.as_str(),
            )
            .before(original)
            .after(&cancelled)
            .reason(format!("{} ({})", RESCHEDULE_REASON, link)),
            AuditRecord::new(
                Actor::System,
                AuditAction::ReservationRequested,
                ObjectType::Reservation,
                replacement.id.as_str(),
            )
            .after(&replacement)
            .reason(format!("Replacement for {}", original.id)),
        ],
    )?;
    tracing::info!(from = %original.id, to = %replacement.id, start = %replacement.start, "reservation rescheduled");
    Ok(replacement.id)
}
