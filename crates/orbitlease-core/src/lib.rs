//! Orbitlease core: reservation arbiter and fault rule engine for shared nodes
//!
//! Nodes expose leasable ports to tenants. This crate decides whether a
//! time-windowed resource request fits a node's power, thermal and downlink
//! ceilings (preempting lower-priority work when allowed), turns streamed
//! port telemetry into remediation and incidents, cascades incident impact
//! onto booked reservations, audits every mutation, and rolls consumption
//! up into daily usage and SLA credits.

pub mod arbiter;
pub mod audit;
pub mod cascade;
pub mod clock;
pub mod fault;
pub mod incident;
pub mod kvstore;
pub mod lifecycle;
pub mod locks;
pub mod registry;
pub mod reservation;
pub mod service;
pub mod types;
pub mod usage;

#[cfg(test)]
mod testutil;

pub use arbiter::{AdmissionStatus, ArbiterResult, CapacitySnapshot, ReservationArbiter, WindowSuggestion};
pub use audit::{Actor, AuditAction, AuditEvent, AuditFilter, AuditTrail, ObjectType};
pub use cascade::CascadeOutcome;
pub use clock::{Clock, ManualClock, SystemClock};
pub use fault::{
    FaultEngine, FaultRuleConfig, IngestOutcome, TelemetryPoint, ViolationTable, MAX_SUSTAIN_SECS,
};
pub use incident::{Incident, IncidentStore};
pub use kvstore::{BatchOp, KvStore, MemoryKvStore};
pub use lifecycle::SweepReport;
pub use registry::{Node, NodeHealth, Port, PortBudget, PortTelemetry, ResourceRegistry};
pub use reservation::{Reservation, ReservationRequest, ReservationStore, ReservationUpdate, ResourceBundle};
pub use service::{LeaseService, Stores};
pub use types::{
    HeartbeatStatus, IncidentId, IncidentStatus, LeaseError, NodeId, PortAction, PortId, PortStatus,
    PriorityTier, RejectReason, ReservationId, ReservationStatus, RuleType, Severity, TenantId,
};
pub use usage::{SlaEvaluation, SlaTerms, UsageRecord, UsageStore};
