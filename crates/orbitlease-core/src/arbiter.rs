//! Reservation arbiter: admission, modification, preemption and
//! alternative-window suggestions.
//!
//! Power, thermal and downlink are checked independently by summing every
//! capacity-holding reservation that overlaps the requested window. When a
//! dimension would exceed the node ceiling, the request is still admitted if
//! some overlapping reservation is preemptible and strictly lower priority;
//! all such reservations are then cancelled. Capacity is not re-verified
//! after preemption.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{Actor, AuditAction, AuditRecord, ObjectType};
use crate::lifecycle::{self, StatusChange};
use crate::registry::Node;
use crate::reservation::{Reservation, ReservationRequest, ReservationUpdate, ResourceBundle};
use crate::service::Stores;
use crate::types::{
    LeaseError, NodeId, PortId, PriorityTier, RejectReason, ReservationId, ReservationStatus,
};

/// Offsets from now at which alternative windows are proposed.
const SUGGESTION_OFFSETS_HOURS: [i64; 3] = [24, 48, 72];

/// A capacity dimension checked at admission.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    Power,
    Thermal,
    Downlink,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Power, Dimension::Thermal, Dimension::Downlink];

    pub fn demand(&self, bundle: &ResourceBundle) -> f64 {
        match self {
            Dimension::Power => bundle.power_avg_w,
            Dimension::Thermal => bundle.thermal_w,
            Dimension::Downlink => bundle.downlink_avg_mbps,
        }
    }

    pub fn ceiling(&self, node: &Node) -> f64 {
        match self {
            Dimension::Power => node.power_generation_max_w,
            Dimension::Thermal => node.thermal_dissipation_max_w,
            Dimension::Downlink => node.downlink_committed_mbps,
        }
    }

    pub fn reject_reason(&self) -> RejectReason {
        match self {
            Dimension::Power => RejectReason::InsufficientPower,
            Dimension::Thermal => RejectReason::ThermalLimit,
            Dimension::Downlink => RejectReason::DownlinkCap,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionStatus {
    Accepted,
    Rejected,
}

/// Alternative window offered with a rejection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WindowSuggestion {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub available_power_w: f64,
}

/// Outcome of `admit` or `modify`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArbiterResult {
    pub status: AdmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<WindowSuggestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
    /// Reservations cancelled to make room.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preempted: Vec<ReservationId>,
}

impl ArbiterResult {
    fn accepted(reservation: Reservation, preempted: Vec<ReservationId>) -> Self {
        Self {
            status: AdmissionStatus::Accepted,
            reason: None,
            suggestions: Vec::new(),
            reservation: Some(reservation),
            preempted,
        }
    }

    fn rejected(reason: RejectReason) -> Self {
        Self {
            status: AdmissionStatus::Rejected,
            reason: Some(reason),
            suggestions: Vec::new(),
            reservation: None,
            preempted: Vec::new(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == AdmissionStatus::Accepted
    }
}

/// Remaining headroom on a node over a window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub node_id: NodeId,
    pub power_w: f64,
    pub thermal_w: f64,
    pub downlink_mbps: f64,
}

/// The capacity part of an admission decision.
#[derive(Debug)]
enum Verdict {
    Fits,
    FitsByPreempting(Vec<Reservation>),
    Exceeds(Dimension),
}

/// The window, bundle and tier being checked.
struct Candidate<'a> {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    resources: &'a ResourceBundle,
    priority: PriorityTier,
    port_id: Option<&'a PortId>,
    /// The reservation being modified, which must not count against itself.
    exclude: Option<&'a ReservationId>,
}

pub struct ReservationArbiter {
    stores: Stores,
}

impl ReservationArbiter {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Decides whether `request` can be admitted and persists the outcome.
    ///
    /// Capacity and port rejections are stored as `REJECTED` reservations;
    /// an unknown node is reported without storing anything.
    pub fn admit(&self, request: &ReservationRequest) -> Result<ArbiterResult, LeaseError> {
        ensure_window(request.start_time, request.end_time)?;
        let node = match self.stores.registry.find_node(&request.node_id)? {
            Some(node) => node,
            None => {
                tracing::warn!(node_id = %request.node_id, "admission for unknown node");
                return Ok(ArbiterResult::rejected(RejectReason::NodeNotFound));
            }
        };
        let actor = Actor::user(request.created_by.clone());

        self.stores.locks.with_node(&node.id, || {
            let candidate = Candidate {
                start: request.start_time,
                end: request.end_time,
                resources: &request.resources,
                priority: request.priority,
                port_id: request.port_id.as_ref(),
                exclude: None,
            };
            let verdict = match self.check_port(&node, candidate.port_id)? {
                Some(reason) => Err(reason),
                None => Ok(self.check_capacity(&node, &candidate)?),
            };

            let now = self.stores.clock.now();
            let victims = match verdict {
                Ok(Verdict::Fits) => Vec::new(),
                Ok(Verdict::FitsByPreempting(victims)) => victims,
                Ok(Verdict::Exceeds(dimension)) => {
                    let reason = dimension.reject_reason();
                    self.persist_rejection(request, reason, &actor, now)?;
                    let mut result = ArbiterResult::rejected(reason);
                    result.suggestions = self.suggest(&node, &candidate)?;
                    return Ok(result);
                }
                Err(reason) => {
                    self.persist_rejection(request, reason, &actor, now)?;
                    return Ok(ArbiterResult::rejected(reason));
                }
            };

            let preempted = self.preempt(&victims, request.priority, &actor)?;
            let reservation = Reservation::from_request(request, ReservationStatus::Accepted, now);
            self.stores.audit.commit(
                vec![self.stores.reservations.put_op(&reservation)?],
                AuditRecord::new(
                    actor.clone(),
                    AuditAction::ReservationAccepted,
                    ObjectType::Reservation,
                    reservation.id.as_str(),
                )
                .after(&reservation),
            )?;
            tracing::info!(
                reservation_id = %reservation.id,
                node_id = %node.id,
                tenant_id = %reservation.tenant_id,
                priority = %reservation.priority,
                preempted = preempted.len(),
                "reservation accepted"
            );
            Ok(ArbiterResult::accepted(reservation, preempted))
        })
    }

    /// Re-runs admission for a merged reservation and overwrites it in place on success.
    pub fn modify(
        &self,
        id: &ReservationId,
        update: &ReservationUpdate,
        actor: &Actor,
    ) -> Result<ArbiterResult, LeaseError> {
        let node_id = match self.stores.reservations.find(id)? {
            Some(existing) => existing.node_id,
            None => return Ok(ArbiterResult::rejected(RejectReason::ReservationNotFound)),
        };
        let node = match self.stores.registry.find_node(&node_id)? {
            Some(node) => node,
            None => return Ok(ArbiterResult::rejected(RejectReason::NodeNotFound)),
        };

        self.stores.locks.with_node(&node.id, || {
            let existing = self.stores.reservations.get(id)?;
            if !matches!(
                existing.status,
                ReservationStatus::Accepted | ReservationStatus::Requested
            ) {
                return Ok(ArbiterResult::rejected(
                    RejectReason::CannotModifyReservationInCurrentState,
                ));
            }

            let mut merged = existing.merged(update);
            ensure_window(merged.start, merged.end)?;
            if let Some(reason) = self.check_port(&node, merged.port_id.as_ref())? {
                return Ok(ArbiterResult::rejected(reason));
            }
            let candidate = Candidate {
                start: merged.start,
                end: merged.end,
                resources: &merged.resources,
                priority: merged.priority,
                port_id: merged.port_id.as_ref(),
                exclude: Some(id),
            };
            let victims = match self.check_capacity(&node, &candidate)? {
                Verdict::Fits => Vec::new(),
                Verdict::FitsByPreempting(victims) => victims,
                Verdict::Exceeds(dimension) => {
                    let mut result = ArbiterResult::rejected(dimension.reject_reason());
                    result.suggestions = self.suggest(&node, &candidate)?;
                    tracing::warn!(
                        reservation_id = %id,
                        reason = %dimension.reject_reason(),
                        "modification rejected"
                    );
                    return Ok(result);
                }
            };

            let preempted = self.preempt(&victims, merged.priority, actor)?;
            merged.status = ReservationStatus::Accepted;
            merged.status_reason = None;
            merged.updated_at = self.stores.clock.now();
            self.stores.audit.commit(
                vec![self.stores.reservations.put_op(&merged)?],
                AuditRecord::new(
                    actor.clone(),
                    AuditAction::ReservationModified,
                    ObjectType::Reservation,
                    merged.id.as_str(),
                )
                .before(&existing)
                .after(&merged),
            )?;
            tracing::info!(reservation_id = %merged.id, preempted = preempted.len(), "reservation modified");
            Ok(ArbiterResult::accepted(merged, preempted))
        })
    }

    /// Cancels a reservation that has not reached a terminal status.
    pub fn cancel(
        &self,
        id: &ReservationId,
        actor: &Actor,
        reason: &str,
    ) -> Result<Reservation, LeaseError> {
        let node_id = self.stores.reservations.get(id)?.node_id;
        self.stores.locks.with_node(&node_id, || {
            let current = self.stores.reservations.get(id)?;
            if current.status.is_terminal() {
                return Err(LeaseError::InvalidTransition {
                    object: id.to_string(),
                    from: current.status.to_string(),
                    to: ReservationStatus::Cancelled.to_string(),
                });
            }
            let cancelled = lifecycle::apply(
                &self.stores,
                &current,
                StatusChange::new(ReservationStatus::Cancelled, AuditAction::ReservationCancelled)
                    .because(reason),
                actor,
            )?;
            tracing::info!(reservation_id = %id, "reservation cancelled");
            Ok(cancelled)
        })
    }

    /// Ceiling minus the summed demand of overlapping capacity-holding reservations.
    pub fn available_capacity(
        &self,
        node_id: &NodeId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CapacitySnapshot, LeaseError> {
        ensure_window(start, end)?;
        let node = self.stores.registry.get_node(node_id)?;
        let overlapping = self
            .stores
            .reservations
            .overlapping(node_id, start, end, None)?;
        let headroom = |d: Dimension| d.ceiling(&node) - committed(&overlapping, d);
        Ok(CapacitySnapshot {
            node_id: node.id.clone(),
            power_w: headroom(Dimension::Power),
            thermal_w: headroom(Dimension::Thermal),
            downlink_mbps: headroom(Dimension::Downlink),
        })
    }

    /// `Some(PORT_UNAVAILABLE)` unless the port exists on `node` and is bookable.
    fn check_port(
        &self,
        node: &Node,
        port_id: Option<&PortId>,
    ) -> Result<Option<RejectReason>, LeaseError> {
        let Some(port_id) = port_id else {
            return Ok(None);
        };
        match self.stores.registry.get_port(port_id) {
            Ok(port) if port.node_id == node.id && port.status.is_bookable() => Ok(None),
            Ok(port) => {
                tracing::warn!(port_id = %port_id, status = %port.status, "port not bookable");
                Ok(Some(RejectReason::PortUnavailable))
            }
            Err(LeaseError::PortNotFound(_)) => Ok(Some(RejectReason::PortUnavailable)),
            Err(e) => Err(e),
        }
    }

    fn check_capacity(&self, node: &Node, candidate: &Candidate<'_>) -> Result<Verdict, LeaseError> {
        let overlapping = self.stores.reservations.overlapping(
            &node.id,
            candidate.start,
            candidate.end,
            candidate.exclude,
        )?;

        let failing: Vec<Dimension> = Dimension::ALL
            .into_iter()
            .filter(|d| d.demand(candidate.resources) + committed(&overlapping, *d) > d.ceiling(node))
            .collect();
        let Some(&first_failing) = failing.first() else {
            return Ok(Verdict::Fits);
        };

        let victims: Vec<Reservation> = overlapping
            .into_iter()
            .filter(|r| r.preemptible && candidate.priority.outranks(r.priority))
            .collect();
        if victims.is_empty() {
            tracing::warn!(
                node_id = %node.id,
                port_id = ?candidate.port_id,
                failing = ?failing,
                "capacity exceeded with nothing preemptible"
            );
            return Ok(Verdict::Exceeds(first_failing));
        }
        Ok(Verdict::FitsByPreempting(victims))
    }

    fn preempt(
        &self,
        victims: &[Reservation],
        by: PriorityTier,
        actor: &Actor,
    ) -> Result<Vec<ReservationId>, LeaseError> {
        let mut preempted = Vec::with_capacity(victims.len());
        for victim in victims {
            let reason = Reservation::preemption_reason(by);
            lifecycle::apply(
                &self.stores,
                victim,
                StatusChange::new(ReservationStatus::Cancelled, AuditAction::ReservationPreempted)
                    .because(reason),
                actor,
            )?;
            tracing::info!(reservation_id = %victim.id, victim_priority = %victim.priority, by = %by, "reservation preempted");
            preempted.push(victim.id.clone());
        }
        Ok(preempted)
    }

    /// Same-length windows starting 24, 48 and 72 hours from now that fit on power alone.
    fn suggest(
        &self,
        node: &Node,
        candidate: &Candidate<'_>,
    ) -> Result<Vec<WindowSuggestion>, LeaseError> {
        let now = self.stores.clock.now();
        let duration = candidate.end - candidate.start;
        let mut suggestions = Vec::new();
        for hours in SUGGESTION_OFFSETS_HOURS {
            let start = now + Duration::hours(hours);
            let end = start + duration;
            let overlapping =
                self.stores
                    .reservations
                    .overlapping(&node.id, start, end, candidate.exclude)?;
            let available = node.power_generation_max_w - committed(&overlapping, Dimension::Power);
            if Dimension::Power.demand(candidate.resources) <= available {
                suggestions.push(WindowSuggestion {
                    start_time: start,
                    end_time: end,
                    available_power_w: available,
                });
            }
        }
        Ok(suggestions)
    }

    fn persist_rejection(
        &self,
        request: &ReservationRequest,
        reason: RejectReason,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let mut rejected = Reservation::from_request(request, ReservationStatus::Rejected, now);
        rejected.status_reason = Some(reason.to_string());
        self.stores.audit.commit(
            vec![self.stores.reservations.put_op(&rejected)?],
            AuditRecord::new(
                actor.clone(),
                AuditAction::ReservationRejected,
                ObjectType::Reservation,
                rejected.id.as_str(),
            )
            .after(&rejected)
            .reason(reason.as_str()),
        )?;
        tracing::warn!(
            reservation_id = %rejected.id,
            node_id = %request.node_id,
            reason = %reason,
            "reservation rejected"
        );
        Ok(())
    }
}

fn committed(reservations: &[Reservation], dimension: Dimension) -> f64 {
    reservations
        .iter()
        .map(|r| dimension.demand(&r.resources))
        .sum()
}

fn ensure_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), LeaseError> {
    if end <= start {
        return Err(LeaseError::InvalidWindow { start, end });
    }
    Ok(())
}
