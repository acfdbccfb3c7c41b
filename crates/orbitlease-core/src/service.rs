//! The service object that owns every store and subsystem.
//!
//! One [`LeaseService`] is constructed per process over an injected
//! [`KvStore`] and [`Clock`] and shared by reference (or `Arc`) with the API
//! and background loops.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::arbiter::{ArbiterResult, CapacitySnapshot, ReservationArbiter};
use crate::audit::{Actor, AuditAction, AuditEvent, AuditFilter, AuditRecord, AuditTrail, ObjectType};
use crate::clock::Clock;
use crate::fault::{FaultEngine, FaultRuleConfig, IngestOutcome, TelemetryPoint};
use crate::incident::{Incident, IncidentStore};
use crate::kvstore::KvStore;
use crate::lifecycle::{self, SweepReport};
use crate::locks::NodeLocks;
use crate::registry::{Node, Port, ResourceRegistry};
use crate::reservation::{Reservation, ReservationRequest, ReservationStore, ReservationUpdate};
use crate::types::{
    IncidentId, IncidentStatus, LeaseError, NodeId, PortAction, PortId, ReservationId, TenantId,
};
use crate::usage::{SlaEvaluation, SlaTerms, UsageAggregator, UsageRecord, UsageStore};

/// Shared handles to every store, the node guards and the clock.
#[derive(Clone)]
pub struct Stores {
    pub registry: Arc<ResourceRegistry>,
    pub reservations: Arc<ReservationStore>,
    pub incidents: Arc<IncidentStore>,
    pub usage: Arc<UsageStore>,
    pub audit: Arc<AuditTrail>,
    pub locks: Arc<NodeLocks>,
    pub clock: Arc<dyn Clock>,
}

impl Stores {
    /// All stores share `kv`, which lets a mutation and its audit event land in one batch.
    pub fn open(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Result<Self, LeaseError> {
        Ok(Self {
            registry: Arc::new(ResourceRegistry::new(kv.clone())),
            reservations: Arc::new(ReservationStore::new(kv.clone())),
            incidents: Arc::new(IncidentStore::new(kv.clone())),
            usage: Arc::new(UsageStore::new(kv.clone())),
            audit: Arc::new(AuditTrail::open(kv, clock.clone())?),
            locks: Arc::new(NodeLocks::new()),
            clock,
        })
    }
}

pub struct LeaseService {
    stores: Stores,
    arbiter: ReservationArbiter,
    faults: FaultEngine,
    usage: UsageAggregator,
}

impl LeaseService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        rules: FaultRuleConfig,
    ) -> Result<Self, LeaseError> {
        let stores = Stores::open(kv, clock)?;
        Ok(Self {
            arbiter: ReservationArbiter::new(stores.clone()),
            faults: FaultEngine::new(stores.clone(), rules),
            usage: UsageAggregator::new(stores.clone()),
            stores,
        })
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn arbiter(&self) -> &ReservationArbiter {
        &self.arbiter
    }

    pub fn faults(&self) -> &FaultEngine {
        &self.faults
    }

    pub fn usage(&self) -> &UsageAggregator {
        &self.usage
    }

    // --- Registry ---

    pub fn register_node(&self, node: &Node) -> Result<(), LeaseError> {
        self.stores.registry.put_node(node)
    }

    pub fn register_port(&self, port: &Port) -> Result<(), LeaseError> {
        self.stores.registry.put_port(port)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, LeaseError> {
        self.stores.registry.list_nodes()
    }

    pub fn get_port(&self, id: &PortId) -> Result<Port, LeaseError> {
        self.stores.registry.get_port(id)
    }

    // --- Reservations ---

    pub fn admit(&self, request: &ReservationRequest) -> Result<ArbiterResult, LeaseError> {
        self.arbiter.admit(request)
    }

    pub fn modify(
        &self,
        id: &ReservationId,
        update: &ReservationUpdate,
        actor: &Actor,
    ) -> Result<ArbiterResult, LeaseError> {
        self.arbiter.modify(id, update, actor)
    }

    pub fn cancel(
        &self,
        id: &ReservationId,
        actor: &Actor,
        reason: &str,
    ) -> Result<Reservation, LeaseError> {
        self.arbiter.cancel(id, actor, reason)
    }

    pub fn available_capacity(
        &self,
        node: &NodeId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CapacitySnapshot, LeaseError> {
        self.arbiter.available_capacity(node, start, end)
    }

    pub fn get_reservation(&self, id: &ReservationId) -> Result<Reservation, LeaseError> {
        self.stores.reservations.get(id)
    }

    /// Reservations filtered by tenant and/or node, oldest first.
    pub fn list_reservations(
        &self,
        tenant: Option<&TenantId>,
        node: Option<&NodeId>,
    ) -> Result<Vec<Reservation>, LeaseError> {
        let mut reservations: Vec<Reservation> = self
            .stores
            .reservations
            .list()?
            .into_iter()
            .filter(|r| tenant.map_or(true, |t| &r.tenant_id == t))
            .filter(|r| node.map_or(true, |n| &r.node_id == n))
            .collect();
        reservations.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(reservations)
    }

    pub fn advance_lifecycle(&self) -> Result<SweepReport, LeaseError> {
        lifecycle::sweep(&self.stores)
    }

    // --- Telemetry, ports and incidents ---

    pub fn ingest_telemetry(&self, point: &TelemetryPoint) -> Result<Option<IngestOutcome>, LeaseError> {
        self.faults.ingest(point)
    }

    /// Sets a port's status directly, bypassing rule evaluation.
    pub fn apply_port_action(
        &self,
        port_id: &PortId,
        action: PortAction,
        actor: &Actor,
        reason: Option<&str>,
    ) -> Result<Port, LeaseError> {
        let node_id = self.stores.registry.get_port(port_id)?.node_id;
        self.stores.locks.with_node(&node_id, || {
            let before = self.stores.registry.get_port(port_id)?;
            let mut after = before.clone();
            after.status = action.target_status(before.tenant_id.is_some());

            let mut record = AuditRecord::new(
                actor.clone(),
                AuditAction::PortActionApplied,
                ObjectType::Port,
                port_id.as_str(),
            )
            .before(&before)
            .after(&after);
            if let Some(reason) = reason {
                record = record.reason(reason);
            }
            self.stores
                .audit
                .commit(vec![self.stores.registry.port_op(&after)?], record)?;
            tracing::info!(
                port_id = %port_id,
                action = ?action,
                from = %before.status,
                to = %after.status,
                "operator port action applied"
            );
            Ok(after)
        })
    }

    pub fn get_incident(&self, id: &IncidentId) -> Result<Incident, LeaseError> {
        self.stores.incidents.get(id)
    }

    pub fn list_incidents(&self, status: Option<IncidentStatus>) -> Result<Vec<Incident>, LeaseError> {
        match status {
            Some(status) => self.stores.incidents.with_status(status),
            None => self.stores.incidents.list(),
        }
    }

    /// Moves an incident along its operator-driven lifecycle.
    pub fn transition_incident(
        &self,
        id: &IncidentId,
        next: IncidentStatus,
        actor: &Actor,
        note: Option<&str>,
    ) -> Result<Incident, LeaseError> {
        let node_id = self.stores.incidents.get(id)?.node_id;
        self.stores.locks.with_node(&node_id, || {
            let before = self.stores.incidents.get(id)?;
            if !before.status.can_transition_to(next) {
                return Err(LeaseError::InvalidTransition {
                    object: id.to_string(),
                    from: before.status.to_string(),
                    to: next.to_string(),
                });
            }
            let now = self.stores.clock.now();
            let mut after = before.clone();
            after.status = next;
            match next {
                IncidentStatus::Ack => after.acknowledged_at = Some(now),
                IncidentStatus::Resolved => after.resolved_at = Some(now),
                _ => {}
            }

            let mut record = AuditRecord::new(
                actor.clone(),
                AuditAction::IncidentTransitioned,
                ObjectType::Incident,
                id.as_str(),
            )
            .before(&before)
            .after(&after);
            if let Some(note) = note {
                record = record.reason(note);
            }
            self.stores
                .audit
                .commit(vec![self.stores.incidents.put_op(&after)?], record)?;
            tracing::info!(incident_id = %id, from = %before.status, to = %next, "incident transitioned");
            Ok(after)
        })
    }

    // --- Audit, usage and SLA ---

    pub fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, LeaseError> {
        self.stores.audit.query(filter)
    }

    pub fn aggregate_usage(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, LeaseError> {
        self.usage.aggregate_usage(tenant, from, to)
    }

    pub fn materialize_usage(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, LeaseError> {
        self.usage.materialize_usage(tenant, from, to)
    }

    pub fn evaluate_sla(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        terms: &SlaTerms,
    ) -> Result<SlaEvaluation, LeaseError> {
        self.usage.evaluate_sla(tenant, from, to, terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bundle, fixture, request_on};
    use crate::types::{PortStatus, PriorityTier};

    #[test]
    fn test_port_action_round_trip() {
        let fx = fixture();
        let port = PortId::new("p1");
        let cut = fx
            .service
            .apply_port_action(&port, PortAction::CutPower, &Actor::user("ops"), Some("manual"))
            .unwrap();
        assert_eq!(cut.status, PortStatus::PowerCut);

        // p1 is leased, so restoring lands on ACTIVE.
        let restored = fx
            .service
            .apply_port_action(&port, PortAction::RestorePower, &Actor::user("ops"), None)
            .unwrap();
        assert_eq!(restored.status, PortStatus::Active);

        let events = fx
            .service
            .query_audit(&AuditFilter::for_object("p1"))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.action == AuditAction::PortActionApplied));
        assert_eq!(events[0].reason.as_deref(), Some("manual"));
    }

    #[test]
    fn test_unleased_port_restores_to_available() {
        let fx = fixture();
        let port = PortId::new("p2");
        fx.service
            .apply_port_action(&port, PortAction::Quarantine, &Actor::System, None)
            .unwrap();
        let port = fx
            .service
            .apply_port_action(&port, PortAction::Unquarantine, &Actor::System, None)
            .unwrap();
        assert_eq!(port.status, PortStatus::Available);
    }

    #[test]
    fn test_port_action_unknown_port() {
        let fx = fixture();
        let err = fx
            .service
            .apply_port_action(&PortId::new("ghost"), PortAction::MuteData, &Actor::System, None)
            .unwrap_err();
        assert!(matches!(err, LeaseError::PortNotFound(_)));
    }

    #[test]
    fn test_list_reservations_filters() {
        let fx = fixture();
        fx.service
            .admit(&request_on(&fx, "p1", bundle(100.0), PriorityTier::P2, false))
            .unwrap();
        let mut other = request_on(&fx, "p2", bundle(100.0), PriorityTier::P2, false);
        other.tenant_id = TenantId::new("globex");
        fx.service.admit(&other).unwrap();

        let acme = TenantId::new("acme");
        assert_eq!(fx.service.list_reservations(Some(&acme), None).unwrap().len(), 1);
        assert_eq!(
            fx.service
                .list_reservations(None, Some(&NodeId::new("n1")))
                .unwrap()
                .len(),
            2
        );
    }
}
