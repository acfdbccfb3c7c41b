//! Reservation records and their store.
//!
//! Reservations are stored under `rsv/{id}`. Overlap queries are a linear
//! scan over the store; at the volumes a single arbiter handles this is
//! cheap enough, and a per-node interval index can replace it later.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::kvstore::{decode, encode, record_key, scan_records, BatchOp, KvStore};
use crate::types::{
    windows_overlap, LeaseError, NodeId, PortId, PriorityTier, ReservationId, ReservationStatus,
    TenantId,
};

const RESERVATION_PREFIX: &[u8] = b"rsv/";

const PREEMPTED_REASON_PREFIX: &str = "Preempted by ";

/// Resources claimed by a reservation for the length of its window.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceBundle {
    pub power_avg_w: f64,
    pub power_peak_w: f64,
    pub energy_budget_wh: f64,
    pub thermal_w: f64,
    pub downlink_avg_mbps: f64,
    pub downlink_budget_mb: f64,
    pub compute_units: f64,
    pub pointing_minutes: f64,
}

/// Inbound admission request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub tenant_id: TenantId,
    pub node_id: NodeId,
    #[serde(default)]
    pub port_id: Option<PortId>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub resources: ResourceBundle,
    pub priority: PriorityTier,
    #[serde(default)]
    pub preemptible: bool,
    pub created_by: String,
}

/// Partial update applied by `modify`. Unset fields keep their current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReservationUpdate {
    #[serde(default)]
    pub port_id: Option<PortId>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: Option<ResourceBundle>,
    #[serde(default)]
    pub priority: Option<PriorityTier>,
    #[serde(default)]
    pub preemptible: Option<bool>,
}

/// A tenant's time-windowed claim `[start, end)` on a node's resources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tenant_id: TenantId,
    pub node_id: NodeId,
    pub port_id: Option<PortId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resources: ResourceBundle,
    pub priority: PriorityTier,
    pub preemptible: bool,
    pub status: ReservationStatus,
    pub status_reason: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on a replacement created by auto-rescheduling.
    pub rescheduled_from: Option<ReservationId>,
    /// Set on a reservation cancelled by auto-rescheduling.
    pub rescheduled_to: Option<ReservationId>,
}

impl Reservation {
    /// Builds a reservation from a request, in `status`, with a fresh id.
    pub fn from_request(
        request: &ReservationRequest,
        status: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::generate(),
            tenant_id: request.tenant_id.clone(),
            node_id: request.node_id.clone(),
            port_id: request.port_id.clone(),
            start: request.start_time,
            end: request.end_time,
            resources: request.resources.clone(),
            priority: request.priority,
            preemptible: request.preemptible,
            status,
            status_reason: None,
            created_by: request.created_by.clone(),
            created_at: now,
            updated_at: now,
            rescheduled_from: None,
            rescheduled_to: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Status reason recorded on a reservation cancelled to make room for `by`.
    pub(crate) fn preemption_reason(by: PriorityTier) -> String {
        format!("{}{} reservation", PREEMPTED_REASON_PREFIX, by)
    }

    /// Cancelled by preemption rather than by its owner or an operator.
    pub fn was_preempted(&self) -> bool {
        self.status == ReservationStatus::Cancelled
            && self
                .status_reason
                .as_deref()
                .is_some_and(|r| r.starts_with(PREEMPTED_REASON_PREFIX))
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        windows_overlap(self.start, self.end, start, end)
    }

    /// Running now or starting later.
    pub fn is_current_or_upcoming(&self, now: DateTime<Utc>) -> bool {
        self.end > now
    }

    /// Returns a copy with `update` merged over the current values.
    pub fn merged(&self, update: &ReservationUpdate) -> Self {
        let mut next = self.clone();
        if let Some(port) = &update.port_id {
            next.port_id = Some(port.clone());
        }
        if let Some(start) = update.start_time {
            next.start = start;
        }
        if let Some(end) = update.end_time {
            next.end = end;
        }
        if let Some(resources) = &update.resources {
            next.resources = resources.clone();
        }
        if let Some(priority) = update.priority {
            next.priority = priority;
        }
        if let Some(preemptible) = update.preemptible {
            next.preemptible = preemptible;
        }
        next
    }
}

/// KV-backed reservation store.
pub struct ReservationStore {
    kv: Arc<dyn KvStore>,
}

impl ReservationStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn put(&self, reservation: &Reservation) -> Result<(), LeaseError> {
        self.kv.put(
            record_key(RESERVATION_PREFIX, reservation.id.as_str()),
            encode(reservation)?,
        )
    }

    pub(crate) fn put_op(&self, reservation: &Reservation) -> Result<BatchOp, LeaseError> {
        Ok(BatchOp::Put {
            key: record_key(RESERVATION_PREFIX, reservation.id.as_str()),
            value: encode(reservation)?,
        })
    }

    pub fn find(&self, id: &ReservationId) -> Result<Option<Reservation>, LeaseError> {
        match self
            .kv
            .get(&record_key(RESERVATION_PREFIX, id.as_str()))?
        {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &ReservationId) -> Result<Reservation, LeaseError> {
        self.find(id)?
            .ok_or_else(|| LeaseError::ReservationNotFound(id.clone()))
    }

    pub fn list(&self) -> Result<Vec<Reservation>, LeaseError> {
        scan_records(self.kv.as_ref(), RESERVATION_PREFIX)
    }

    pub fn on_node(&self, node_id: &NodeId) -> Result<Vec<Reservation>, LeaseError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| &r.node_id == node_id)
            .collect())
    }

    pub fn on_port(&self, port_id: &PortId) -> Result<Vec<Reservation>, LeaseError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.port_id.as_ref() == Some(port_id))
            .collect())
    }

    pub fn for_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Reservation>, LeaseError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| &r.tenant_id == tenant_id)
            .collect())
    }

    /// Capacity-holding reservations on `node_id` whose window overlaps `[start, end)`.
    ///
    /// `exclude` drops one reservation from the result, used when a
    /// modification is re-checked against everything except itself.
    pub fn overlapping(
        &self,
        node_id: &NodeId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude: Option<&ReservationId>,
    ) -> Result<Vec<Reservation>, LeaseError> {
        Ok(self
            .on_node(node_id)?
            .into_iter()
            .filter(|r| r.status.holds_capacity())
            .filter(|r| r.overlaps(start, end))
            .filter(|r| exclude != Some(&r.id))
            .collect())
    }
}
