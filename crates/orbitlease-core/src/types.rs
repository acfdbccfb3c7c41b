use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a node (a shared-infrastructure unit with fixed capacity).
    NodeId
);
string_id!(
    /// Identifier of a leasable port on a node.
    PortId
);
string_id!(
    /// Identifier of a tenant.
    TenantId
);
string_id!(
    /// Identifier of a reservation.
    ReservationId
);
string_id!(
    /// Identifier of an incident.
    IncidentId
);

impl ReservationId {
    /// Allocates a fresh reservation id.
    pub fn generate() -> Self {
        Self(format!("rsv-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl IncidentId {
    /// Allocates a fresh incident id.
    pub fn generate() -> Self {
        Self(format!("inc-{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Live status of a port. Only the fault rule engine and operator actions change it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortStatus {
    Available,
    Active,
    Throttled,
    MutedData,
    PowerCut,
    Quarantined,
    Maintenance,
    Isolated,
}

impl PortStatus {
    /// A reservation may name this port.
    pub fn is_bookable(&self) -> bool {
        matches!(self, PortStatus::Available | PortStatus::Active)
    }

    /// The port is in a remediation state set by a fault or an operator.
    pub fn is_faulted(&self) -> bool {
        matches!(
            self,
            PortStatus::Throttled
                | PortStatus::MutedData
                | PortStatus::PowerCut
                | PortStatus::Quarantined
                | PortStatus::Isolated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Available => "AVAILABLE",
            PortStatus::Active => "ACTIVE",
            PortStatus::Throttled => "THROTTLED",
            PortStatus::MutedData => "MUTED_DATA",
            PortStatus::PowerCut => "POWER_CUT",
            PortStatus::Quarantined => "QUARANTINED",
            PortStatus::Maintenance => "MAINTENANCE",
            PortStatus::Isolated => "ISOLATED",
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Requested,
    Accepted,
    AtRisk,
    InProgress,
    Completed,
    Preempted,
    Cancelled,
    Rejected,
    Failed,
}

impl ReservationStatus {
    /// Statuses that still hold capacity on the node during admission.
    pub fn holds_capacity(&self) -> bool {
        !matches!(
            self,
            ReservationStatus::Cancelled | ReservationStatus::Completed | ReservationStatus::Rejected
        )
    }

    /// Statuses from which no further transition happens.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed
                | ReservationStatus::Preempted
                | ReservationStatus::Cancelled
                | ReservationStatus::Rejected
                | ReservationStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Requested => "REQUESTED",
            ReservationStatus::Accepted => "ACCEPTED",
            ReservationStatus::AtRisk => "AT_RISK",
            ReservationStatus::InProgress => "IN_PROGRESS",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Preempted => "PREEMPTED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Rejected => "REJECTED",
            ReservationStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Priority tier of a reservation, `P0` highest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityTier {
    P0,
    P1,
    P2,
    P3,
}

impl PriorityTier {
    /// Numeric rank used for preemption (P0=4 .. P3=1).
    pub fn rank(&self) -> u8 {
        match self {
            PriorityTier::P0 => 4,
            PriorityTier::P1 => 3,
            PriorityTier::P2 => 2,
            PriorityTier::P3 => 1,
        }
    }

    /// True when `self` strictly outranks `other`.
    pub fn outranks(&self, other: PriorityTier) -> bool {
        self.rank() > other.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::P0 => "P0",
            PriorityTier::P1 => "P1",
            PriorityTier::P2 => "P2",
            PriorityTier::P3 => "P3",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Sev0,
    Sev1,
    Sev2,
    Sev3,
}

impl Severity {
    /// Downtime charged against SLA for one open incident of this severity.
    pub fn downtime_minutes(&self) -> f64 {
        match self {
            Severity::Sev0 => 60.0,
            Severity::Sev1 => 30.0,
            Severity::Sev2 => 15.0,
            Severity::Sev3 => 5.0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Ack,
    Mitigated,
    Resolved,
    PostmortemRequired,
}

impl IncidentStatus {
    /// Operator transitions allowed after the engine opens an incident.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Open, Ack)
                | (Open, Mitigated)
                | (Open, Resolved)
                | (Ack, Mitigated)
                | (Ack, Resolved)
                | (Mitigated, Resolved)
                | (Resolved, PostmortemRequired)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Ack => "ACK",
            IncidentStatus::Mitigated => "MITIGATED",
            IncidentStatus::Resolved => "RESOLVED",
            IncidentStatus::PostmortemRequired => "POSTMORTEM_REQUIRED",
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Fault rule evaluated against every telemetry point.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    OverCurrent,
    OverTemp,
    DataErrorRate,
    Heartbeat,
}

impl RuleType {
    pub const ALL: [RuleType; 4] = [
        RuleType::OverCurrent,
        RuleType::OverTemp,
        RuleType::DataErrorRate,
        RuleType::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::OverCurrent => "OVER_CURRENT",
            RuleType::OverTemp => "OVER_TEMP",
            RuleType::DataErrorRate => "DATA_ERROR_RATE",
            RuleType::Heartbeat => "HEARTBEAT",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatStatus {
    #[default]
    Ok,
    Stale,
    Missing,
}

/// Direct operator intervention on a port, bypassing rule evaluation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortAction {
    CutPower,
    MuteData,
    RestorePower,
    UnmuteData,
    Quarantine,
    Unquarantine,
}

impl PortAction {
    /// Target status; `leased` decides where restoring actions land.
    pub fn target_status(&self, leased: bool) -> PortStatus {
        let restored = if leased {
            PortStatus::Active
        } else {
            PortStatus::Available
        };
        match self {
            PortAction::CutPower => PortStatus::PowerCut,
            PortAction::MuteData => PortStatus::MutedData,
            PortAction::Quarantine => PortStatus::Quarantined,
            PortAction::RestorePower | PortAction::UnmuteData | PortAction::Unquarantine => {
                restored
            }
        }
    }
}

/// Enumerated, non-fatal reasons an admission or modification is refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    PortUnavailable,
    InsufficientPower,
    ThermalLimit,
    DownlinkCap,
    NodeNotFound,
    ReservationNotFound,
    CannotModifyReservationInCurrentState,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::PortUnavailable => "PORT_UNAVAILABLE",
            RejectReason::InsufficientPower => "INSUFFICIENT_POWER",
            RejectReason::ThermalLimit => "THERMAL_LIMIT",
            RejectReason::DownlinkCap => "DOWNLINK_CAP",
            RejectReason::NodeNotFound => "NODE_NOT_FOUND",
            RejectReason::ReservationNotFound => "RESERVATION_NOT_FOUND",
            RejectReason::CannotModifyReservationInCurrentState => {
                "CANNOT_MODIFY_RESERVATION_IN_CURRENT_STATE"
            }
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Half-open overlap test for `[a_start, a_end)` and `[b_start, b_end)`.
pub fn windows_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

/// Engine faults. Admission outcomes are never reported through this type.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The backing key-value store failed.
    #[error("kv store error: {0}")]
    Kv(String),

    /// A stored record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("port {0} not found")]
    PortNotFound(PortId),

    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),

    #[error("incident {0} not found")]
    IncidentNotFound(IncidentId),

    /// A lifecycle transition that the state machine does not allow.
    #[error("invalid transition for {object}: {from} -> {to}")]
    InvalidTransition {
        /// Object the transition was attempted on
        object: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    #[error("invalid window: end {end} is not after start {start}")]
    InvalidWindow {
        /// Window start
        start: DateTime<Utc>,
        /// Window end
        end: DateTime<Utc>,
    },
}
