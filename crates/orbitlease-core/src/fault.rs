//! Fault rule engine.
//!
//! Every telemetry point refreshes the port's live snapshot and is evaluated
//! against each rule independently. Sustained rules track a violation window
//! per `(port, rule)` in a [`ViolationTable`] and fire once the condition has
//! held continuously for the rule's sustain period; instantaneous rules fire
//! on the first qualifying point. Firing is gated by an open-incident check
//! so at most one `OPEN` incident exists per `(port, rule)`.
//!
//! Violation windows live in memory for the lifetime of the process. A
//! restart forgets them, which is equivalent to every violation resetting.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::audit::{Actor, AuditAction, AuditRecord, ObjectType};
use crate::cascade::{self, CascadeOutcome};
use crate::incident::Incident;
use crate::registry::{Port, PortTelemetry};
use crate::service::Stores;
use crate::types::{
    HeartbeatStatus, IncidentId, IncidentStatus, LeaseError, NodeId, PortId, PortStatus, RuleType,
    Severity,
};

/// One inbound telemetry sample for a port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub timestamp: DateTime<Utc>,
    pub port_id: PortId,
    pub node_id: NodeId,
    pub power_draw: f64,
    pub temperature: f64,
    pub voltage: f64,
    pub current: f64,
    pub data_rate: f64,
    /// Errors per second.
    pub data_error_rate: f64,
    pub heartbeat_status: HeartbeatStatus,
    /// Fires OVER_TEMP immediately, bypassing the sustain period.
    #[serde(default)]
    pub simulated_over_temp: bool,
}

impl TelemetryPoint {
    fn snapshot(&self) -> PortTelemetry {
        PortTelemetry {
            power_draw_w: self.power_draw,
            temperature_c: self.temperature,
            voltage_v: self.voltage,
            current_a: self.current,
            data_rate_mbps: self.data_rate,
            data_error_rate: self.data_error_rate,
            heartbeat: self.heartbeat_status,
            last_seen: Some(self.timestamp),
        }
    }
}

/// Longest sustain period a rule may be configured with.
pub const MAX_SUSTAIN_SECS: u64 = 86_400;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultRuleConfig {
    pub over_current_sustain_secs: u64,
    pub over_temp_celsius: f64,
    pub over_temp_sustain_secs: u64,
    pub max_data_error_rate: f64,
}

impl Default for FaultRuleConfig {
    fn default() -> Self {
        Self {
            over_current_sustain_secs: 30,
            over_temp_celsius: 60.0,
            over_temp_sustain_secs: 60,
            max_data_error_rate: 5.0,
        }
    }
}

/// A rule's condition, sustain period and remediation.
#[derive(Clone, Debug, PartialEq)]
pub struct FaultRule {
    pub rule: RuleType,
    pub severity: Severity,
    pub remediation: PortStatus,
    /// Zero for instantaneous rules.
    pub for_secs: u64,
    threshold: f64,
}

impl FaultRule {
    pub fn is_instantaneous(&self) -> bool {
        self.for_secs == 0
    }

    /// Sustain period as a duration. Values past chrono's range saturate, so
    /// such a rule never fires on the sustain path.
    pub fn sustain(&self) -> Duration {
        i64::try_from(self.for_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    /// Whether `point` violates this rule for `port`.
    pub fn evaluate(&self, point: &TelemetryPoint, port: &Port) -> bool {
        match self.rule {
            RuleType::OverCurrent => point.power_draw > port.budget.power_peak_w,
            RuleType::OverTemp => point.temperature > self.threshold || point.simulated_over_temp,
            RuleType::DataErrorRate => point.data_error_rate > self.threshold,
            RuleType::Heartbeat => matches!(
                point.heartbeat_status,
                HeartbeatStatus::Missing | HeartbeatStatus::Stale
            ),
        }
    }

    /// Whether `point` skips the sustain period.
    fn fires_immediately(&self, point: &TelemetryPoint) -> bool {
        self.is_instantaneous() || (self.rule == RuleType::OverTemp && point.simulated_over_temp)
    }

    fn describe(&self, point: &TelemetryPoint, port: &Port) -> String {
        match self.rule {
            RuleType::OverCurrent => format!(
                "Power draw {:.1} W exceeds peak budget {:.1} W for {}s",
                point.power_draw, port.budget.power_peak_w, self.for_secs
            ),
            RuleType::OverTemp if point.simulated_over_temp => {
                format!("Simulated over-temperature at {:.1} C", point.temperature)
            }
            RuleType::OverTemp => format!(
                "Temperature {:.1} C above {:.1} C for {}s",
                point.temperature, self.threshold, self.for_secs
            ),
            RuleType::DataErrorRate => format!(
                "Data error rate {:.1}/s above {:.1}/s",
                point.data_error_rate, self.threshold
            ),
            RuleType::Heartbeat => format!("Heartbeat {:?}", point.heartbeat_status),
        }
    }
}

pub fn default_fault_rules(config: &FaultRuleConfig) -> Vec<FaultRule> {
    vec![
        FaultRule {
            rule: RuleType::OverCurrent,
            severity: Severity::Sev2,
            remediation: PortStatus::Throttled,
            for_secs: config.over_current_sustain_secs,
            threshold: 0.0,
        },
        FaultRule {
            rule: RuleType::OverTemp,
            severity: Severity::Sev1,
            remediation: PortStatus::PowerCut,
            for_secs: config.over_temp_sustain_secs,
            threshold: config.over_temp_celsius,
        },
        FaultRule {
            rule: RuleType::DataErrorRate,
            severity: Severity::Sev2,
            remediation: PortStatus::MutedData,
            for_secs: 0,
            threshold: config.max_data_error_rate,
        },
        FaultRule {
            rule: RuleType::Heartbeat,
            severity: Severity::Sev1,
            remediation: PortStatus::Quarantined,
            for_secs: 0,
            threshold: 0.0,
        },
    ]
}

/// When a condition started and was last seen holding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ViolationWindow {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

impl ViolationWindow {
    pub fn held_for(&self) -> Duration {
        self.last - self.first
    }
}

/// Process-lifetime table of open violation windows keyed by `(port, rule)`.
#[derive(Debug, Default)]
pub struct ViolationTable {
    windows: Mutex<HashMap<(PortId, RuleType), ViolationWindow>>,
}

impl ViolationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a window at `at`, or extends the existing one to `at`.
    pub fn insert(&self, port: &PortId, rule: RuleType, at: DateTime<Utc>) -> ViolationWindow {
        let mut windows = self.windows.lock();
        let window = windows
            .entry((port.clone(), rule))
            .and_modify(|w| w.last = at)
            .or_insert(ViolationWindow { first: at, last: at });
        *window
    }

    pub fn clear(&self, port: &PortId, rule: RuleType) -> Option<ViolationWindow> {
        self.windows.lock().remove(&(port.clone(), rule))
    }

    pub fn get(&self, port: &PortId, rule: RuleType) -> Option<ViolationWindow> {
        self.windows.lock().get(&(port.clone(), rule)).copied()
    }

    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FiredRule {
    pub rule: RuleType,
    pub incident_id: IncidentId,
    pub port_status: PortStatus,
    pub cascade: CascadeOutcome,
}

/// What one telemetry point caused.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub fired: Vec<FiredRule>,
    /// Rules whose threshold was met while an incident was already open.
    pub deduplicated: Vec<RuleType>,
}

pub struct FaultEngine {
    stores: Stores,
    rules: Vec<FaultRule>,
    violations: ViolationTable,
}

impl FaultEngine {
    pub fn new(stores: Stores, config: FaultRuleConfig) -> Self {
        Self {
            stores,
            rules: default_fault_rules(&config),
            violations: ViolationTable::new(),
        }
    }

    pub fn rules(&self) -> &[FaultRule] {
        &self.rules
    }

    pub fn violations(&self) -> &ViolationTable {
        &self.violations
    }

    /// Processes one point. Returns `None` when the port is unknown.
    pub fn ingest(&self, point: &TelemetryPoint) -> Result<Option<IngestOutcome>, LeaseError> {
        let node_id = match self.stores.registry.get_port(&point.port_id) {
            Ok(port) => port.node_id,
            Err(LeaseError::PortNotFound(_)) => {
                tracing::warn!(port_id = %point.port_id, "dropping telemetry for unknown port");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if node_id != point.node_id {
            tracing::debug!(
                port_id = %point.port_id,
                reported = %point.node_id,
                registered = %node_id,
                "telemetry node differs from registry, using registry"
            );
        }

        self.stores
            .locks
            .with_node(&node_id, || self.evaluate(point))
            .map(Some)
    }

    fn evaluate(&self, point: &TelemetryPoint) -> Result<IngestOutcome, LeaseError> {
        let mut port = self
            .stores
            .registry
            .record_telemetry(&point.port_id, point.snapshot())?;
        let mut outcome = IngestOutcome::default();

        for rule in &self.rules {
            if !rule.evaluate(point, &port) {
                if let Some(window) = self.violations.clear(&port.id, rule.rule) {
                    tracing::debug!(
                        port_id = %port.id,
                        rule = %rule.rule,
                        held_secs = window.held_for().num_seconds(),
                        "condition cleared, violation window reset"
                    );
                }
                continue;
            }

            if !rule.fires_immediately(point) {
                let window = self.violations.insert(&port.id, rule.rule, point.timestamp);
                if window.held_for() < rule.sustain() {
                    tracing::debug!(
                        port_id = %port.id,
                        rule = %rule.rule,
                        held_secs = window.held_for().num_seconds(),
                        sustain_secs = rule.for_secs,
                        "violation window tracking"
                    );
                    continue;
                }
            }

            if let Some(open) = self.stores.incidents.find_open(&port.id, rule.rule)? {
                tracing::debug!(
                    port_id = %port.id,
                    rule = %rule.rule,
                    incident_id = %open.id,
                    "incident already open, not firing"
                );
                outcome.deduplicated.push(rule.rule);
                continue;
            }

            let fired = self.fire(&port, rule, point)?;
            port.status = fired.port_status;
            outcome.fired.push(fired);
        }
        Ok(outcome)
    }

    /// Applies remediation, opens the incident, then runs the cascade.
    ///
    /// Port status, incident and both audit events land in one batch. A
    /// cascade failure leaves the incident open and is returned.
    fn fire(
        &self,
        port: &Port,
        rule: &FaultRule,
        point: &TelemetryPoint,
    ) -> Result<FiredRule, LeaseError> {
        let mut remediated = port.clone();
        remediated.status = rule.remediation;

        let affected = cascade::affected(&self.stores, &port.id, self.stores.clock.now())?;
        let incident = Incident {
            id: IncidentId::generate(),
            node_id: port.node_id.clone(),
            port_ids: vec![port.id.clone()],
            tenant_id: port.tenant_id.clone(),
            rule: rule.rule,
            severity: rule.severity,
            status: IncidentStatus::Open,
            summary: rule.describe(point, port),
            actions_taken: vec![format!(
                "Port {} set {} -> {}",
                port.id, port.status, rule.remediation
            )],
            affected_reservations: affected,
            opened_at: point.timestamp,
            acknowledged_at: None,
            resolved_at: None,
        };

        self.stores.audit.commit_all(
            vec![
                self.stores.registry.port_op(&remediated)?,
                self.stores.incidents.put_op(&incident)?,
            ],
            vec![
                AuditRecord::new(
                    Actor::System,
                    AuditAction::PortStatusChanged,
                    ObjectType::Port,
                    port.id.as_str(),
                )
                .before(port)
                .after(&remediated)
                .reason(format!("{} rule fired ({})", rule.rule, incident.id)),
                AuditRecord::new(
                    Actor::System,
                    AuditAction::IncidentOpened,
                    ObjectType::Incident,
                    incident.id.as_str(),
                )
                .after(&incident)
                .reason(incident.summary.clone()),
            ],
        )?;
        self.violations.clear(&port.id, rule.rule);
        tracing::info!(
            port_id = %port.id,
            node_id = %port.node_id,
            rule = %rule.rule,
            severity = ?rule.severity,
            incident_id = %incident.id,
            status = %rule.remediation,
            "fault rule fired"
        );

        let cascade = cascade::run(&self.stores, &port.id, &incident.id).map_err(|e| {
            tracing::error!(
                incident_id = %incident.id,
                port_id = %port.id,
                error = %e,
                "cascade failed, incident left open"
            );
            e
        })?;

        Ok(FiredRule {
            rule: rule.rule,
            incident_id: incident.id,
            port_status: rule.remediation,
            cascade,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::testutil::{bundle, fixture, Fixture};
    use crate::types::PriorityTier;

    fn point(fx: &Fixture, offset_secs: i64) -> TelemetryPoint {
        TelemetryPoint {
            timestamp: fx.clock_now() + Duration::seconds(offset_secs),
            port_id: PortId::new("p1"),
            node_id: NodeId::new("n1"),
            power_draw: 600.0,
            temperature: 35.0,
            voltage: 28.0,
            current: 21.4,
            data_rate: 120.0,
            data_error_rate: 0.0,
            heartbeat_status: HeartbeatStatus::Ok,
            simulated_over_temp: false,
        }
    }

    fn hot(fx: &Fixture, offset_secs: i64) -> TelemetryPoint {
        TelemetryPoint {
            temperature: 62.0,
            ..point(fx, offset_secs)
        }
    }

    fn engine(fx: &Fixture) -> FaultEngine {
        FaultEngine::new(fx.stores.clone(), FaultRuleConfig::default())
    }

    #[test]
    fn test_nominal_point_updates_snapshot_only() {
        let fx = fixture();
        let engine = engine(&fx);
        let outcome = engine.ingest(&point(&fx, 0)).unwrap().unwrap();
        assert!(outcome.fired.is_empty());

        let port = fx.stores.registry.get_port(&PortId::new("p1")).unwrap();
        assert_eq!(port.telemetry.power_draw_w, 600.0);
        assert_eq!(port.telemetry.last_seen, Some(fx.clock_now()));
        assert_eq!(port.status, PortStatus::Active);
        assert_eq!(fx.stores.audit.event_count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_port_is_dropped() {
        let fx = fixture();
        let mut p = point(&fx, 0);
        p.port_id = PortId::new("ghost");
        assert!(engine(&fx).ingest(&p).unwrap().is_none());
    }

    #[test]
    fn test_over_temp_waits_for_sustain() {
        let fx = fixture();
        let engine = engine(&fx);
        for offset in [0, 40] {
            let outcome = engine.ingest(&hot(&fx, offset)).unwrap().unwrap();
            assert!(outcome.fired.is_empty());
        }
        let window = engine
            .violations()
            .get(&PortId::new("p1"), RuleType::OverTemp)
            .unwrap();
        assert_eq!(window.held_for(), Duration::seconds(40));

        let outcome = engine.ingest(&hot(&fx, 61)).unwrap().unwrap();
        assert_eq!(outcome.fired.len(), 1);
        let fired = &outcome.fired[0];
        assert_eq!(fired.rule, RuleType::OverTemp);
        assert_eq!(fired.port_status, PortStatus::PowerCut);

        let incident = fx.stores.incidents.get(&fired.incident_id).unwrap();
        assert_eq!(incident.severity, Severity::Sev1);
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.tenant_id.as_ref().map(|t| t.as_str()), Some("acme"));
        assert!(engine.violations().is_empty());
    }

    #[test]
    fn test_cleared_condition_resets_window() {
        let fx = fixture();
        let engine = engine(&fx);
        engine.ingest(&hot(&fx, 0)).unwrap();
        engine.ingest(&hot(&fx, 50)).unwrap();
        engine.ingest(&point(&fx, 55)).unwrap();
        assert!(engine.violations().is_empty());

        // A fresh window starts at 60; 110 is only 50s into it.
        engine.ingest(&hot(&fx, 60)).unwrap();
        let outcome = engine.ingest(&hot(&fx, 110)).unwrap().unwrap();
        assert!(outcome.fired.is_empty());
        let outcome = engine.ingest(&hot(&fx, 120)).unwrap().unwrap();
        assert_eq!(outcome.fired.len(), 1);
    }

    #[test]
    fn test_sustain_beyond_chrono_range_never_fires() {
        let fx = fixture();
        let engine = FaultEngine::new(
            fx.stores.clone(),
            FaultRuleConfig {
                over_temp_sustain_secs: 10_000_000_000_000_000,
                ..FaultRuleConfig::default()
            },
        );
        let rule = engine
            .rules()
            .iter()
            .find(|r| r.rule == RuleType::OverTemp)
            .unwrap();
        assert_eq!(rule.sustain(), Duration::MAX);

        for offset in [0, 3600, 86_400 * 365] {
            let outcome = engine.ingest(&hot(&fx, offset)).unwrap().unwrap();
            assert!(outcome.fired.is_empty());
        }
        assert!(engine
            .violations()
            .get(&PortId::new("p1"), RuleType::OverTemp)
            .is_some());
        assert_eq!(fx.stores.audit.event_count().unwrap(), 0);
    }

    #[test]
    fn test_over_current_uses_port_peak_budget() {
        let fx = fixture();
        let engine = engine(&fx);
        let surge = |offset| TelemetryPoint {
            power_draw: 1300.0,
            ..point(&fx, offset)
        };
        assert!(engine.ingest(&surge(0)).unwrap().unwrap().fired.is_empty());
        assert!(engine.ingest(&surge(29)).unwrap().unwrap().fired.is_empty());
        let outcome = engine.ingest(&surge(30)).unwrap().unwrap();
        assert_eq!(outcome.fired[0].rule, RuleType::OverCurrent);
        assert_eq!(
            fx.stores.registry.get_port(&PortId::new("p1")).unwrap().status,
            PortStatus::Throttled
        );
    }

    #[test]
    fn test_instantaneous_rules_and_dedup() {
        let fx = fixture();
        let engine = engine(&fx);
        let noisy = |offset| TelemetryPoint {
            data_error_rate: 9.0,
            ..point(&fx, offset)
        };
        let first = engine.ingest(&noisy(0)).unwrap().unwrap();
        assert_eq!(first.fired[0].rule, RuleType::DataErrorRate);
        assert_eq!(first.fired[0].port_status, PortStatus::MutedData);

        let second = engine.ingest(&noisy(1)).unwrap().unwrap();
        assert!(second.fired.is_empty());
        assert_eq!(second.deduplicated, vec![RuleType::DataErrorRate]);
        assert_eq!(
            fx.stores
                .incidents
                .with_status(IncidentStatus::Open)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_heartbeat_quarantines() {
        let fx = fixture();
        let engine = engine(&fx);
        let stale = TelemetryPoint {
            heartbeat_status: HeartbeatStatus::Stale,
            ..point(&fx, 0)
        };
        let outcome = engine.ingest(&stale).unwrap().unwrap();
        assert_eq!(outcome.fired[0].port_status, PortStatus::Quarantined);
        let incident = fx.stores.incidents.get(&outcome.fired[0].incident_id).unwrap();
        assert_eq!(incident.rule, RuleType::Heartbeat);
        assert_eq!(incident.severity, Severity::Sev1);
    }

    #[test]
    fn test_simulated_over_temp_fires_immediately() {
        let fx = fixture();
        let engine = engine(&fx);
        let forced = TelemetryPoint {
            simulated_over_temp: true,
            ..point(&fx, 0)
        };
        let outcome = engine.ingest(&forced).unwrap().unwrap();
        assert_eq!(outcome.fired[0].rule, RuleType::OverTemp);
        assert_eq!(outcome.fired[0].port_status, PortStatus::PowerCut);
    }

    #[test]
    fn test_firing_audits_port_and_incident() {
        let fx = fixture();
        let engine = engine(&fx);
        let r = fx
            .arbiter
            .admit(&crate::testutil::request_on(
                &fx,
                "p1",
                bundle(300.0),
                PriorityTier::P1,
                false,
            ))
            .unwrap()
            .reservation
            .unwrap();

        let stale = TelemetryPoint {
            heartbeat_status: HeartbeatStatus::Missing,
            ..point(&fx, 0)
        };
        let outcome = engine.ingest(&stale).unwrap().unwrap();
        let fired = &outcome.fired[0];
        assert_eq!(fired.cascade.at_risk, vec![r.id.clone()]);

        let port_events = fx
            .stores
            .audit
            .query(&AuditFilter::for_object("p1"))
            .unwrap();
        assert_eq!(port_events.len(), 1);
        assert_eq!(port_events[0].action, AuditAction::PortStatusChanged);

        let incident_events = fx
            .stores
            .audit
            .query(&AuditFilter::for_object(fired.incident_id.as_str()))
            .unwrap();
        assert_eq!(incident_events.len(), 1);
        assert_eq!(incident_events[0].action, AuditAction::IncidentOpened);

        let incident = fx.stores.incidents.get(&fired.incident_id).unwrap();
        assert_eq!(incident.affected_reservations, vec![r.id]);
    }
}
