//! Incidents opened by the fault rule engine.
//!
//! Incidents are stored under `inc/{id}`. The engine only ever creates them
//! in `OPEN`; everything after that is operator-driven.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kvstore::{decode, encode, record_key, scan_records, BatchOp, KvStore};
use crate::types::{
    IncidentId, IncidentStatus, LeaseError, NodeId, PortId, ReservationId, RuleType, Severity,
    TenantId,
};

const INCIDENT_PREFIX: &[u8] = b"inc/";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub node_id: NodeId,
    pub port_ids: Vec<PortId>,
    pub tenant_id: Option<TenantId>,
    pub rule: RuleType,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub summary: String,
    /// Remediation the engine applied automatically.
    pub actions_taken: Vec<String>,
    /// Reservations marked at risk or rescheduled by the cascade.
    pub affected_reservations: Vec<ReservationId>,
    pub opened_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// True when this incident blocks another firing of `rule` on `port`.
    pub fn is_open_for(&self, port: &PortId, rule: RuleType) -> bool {
        self.status == IncidentStatus::Open && self.rule == rule && self.port_ids.contains(port)
    }
}

pub struct IncidentStore {
    kv: Arc<dyn KvStore>,
}

impl IncidentStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub(crate) fn put_op(&self, incident: &Incident) -> Result<BatchOp, LeaseError> {
        Ok(BatchOp::Put {
            key: record_key(INCIDENT_PREFIX, incident.id.as_str()),
            value: encode(incident)?,
        })
    }

    pub fn put(&self, incident: &Incident) -> Result<(), LeaseError> {
        self.kv.write_batch(vec![self.put_op(incident)?])
    }

    pub fn get(&self, id: &IncidentId) -> Result<Incident, LeaseError> {
        match self.kv.get(&record_key(INCIDENT_PREFIX, id.as_str()))? {
            Some(value) => decode(&value),
            None => Err(LeaseError::IncidentNotFound(id.clone())),
        }
    }

    pub fn list(&self) -> Result<Vec<Incident>, LeaseError> {
        let mut incidents: Vec<Incident> = scan_records(self.kv.as_ref(), INCIDENT_PREFIX)?;
        incidents.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        Ok(incidents)
    }

    pub fn with_status(&self, status: IncidentStatus) -> Result<Vec<Incident>, LeaseError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.status == status)
            .collect())
    }

    /// The open incident for `(port, rule)`, if any.
    pub fn find_open(
        &self,
        port: &PortId,
        rule: RuleType,
    ) -> Result<Option<Incident>, LeaseError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|i| i.is_open_for(port, rule)))
    }
}
