//! Append-only audit trail.
//!
//! Every state mutation in the arbiter, fault engine, cascade and lifecycle
//! code emits exactly one [`AuditEvent`]. Events are keyed `audit/{id:020}`
//! so a prefix scan returns them in append order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::kvstore::{encode, scan_records, BatchOp, KvStore};
use crate::types::LeaseError;

const AUDIT_PREFIX: &[u8] = b"audit/";

/// Who caused a mutation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    System,
    User(String),
}

impl Actor {
    pub fn user(name: impl Into<String>) -> Self {
        Actor::User(name.into())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    ReservationAccepted,
    ReservationRejected,
    ReservationModified,
    ReservationCancelled,
    ReservationPreempted,
    ReservationAtRisk,
    ReservationRescheduled,
    ReservationRequested,
    ReservationStarted,
    ReservationCompleted,
    ReservationFailed,
    PortStatusChanged,
    PortActionApplied,
    IncidentOpened,
    IncidentTransitioned,
    UsageMaterialized,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    Reservation,
    Port,
    Incident,
    UsageRecord,
}

/// Immutable record of one mutation. Snapshots are JSON documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub action: AuditAction,
    pub object_type: ObjectType,
    pub object_id: String,
    pub before: Option<String>,
    pub after: Option<String>,
    pub reason: Option<String>,
}

/// An audit event before it is assigned an id and timestamp.
#[derive(Clone, Debug)]
pub struct AuditRecord {
    actor: Actor,
    action: AuditAction,
    object_type: ObjectType,
    object_id: String,
    before: Option<String>,
    after: Option<String>,
    reason: Option<String>,
    /// First snapshot that failed to serialize; the commit is refused.
    snapshot_error: Option<String>,
}

impl AuditRecord {
    pub fn new(
        actor: Actor,
        action: AuditAction,
        object_type: ObjectType,
        object_id: impl Into<String>,
    ) -> Self {
        Self {
            actor,
            action,
            object_type,
            object_id: object_id.into(),
            before: None,
            after: None,
            reason: None,
            snapshot_error: None,
        }
    }

    pub fn before<T: Serialize>(mut self, state: &T) -> Self {
        self.before = self.snapshot(state);
        self
    }

    pub fn after<T: Serialize>(mut self, state: &T) -> Self {
        self.after = self.snapshot(state);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn snapshot<T: Serialize>(&mut self, state: &T) -> Option<String> {
        match serde_json::to_string(state) {
            Ok(json) => Some(json),
            Err(e) => {
                self.snapshot_error.get_or_insert_with(|| e.to_string());
                None
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub object_id: Option<String>,
    pub object_type: Option<ObjectType>,
    pub action: Option<AuditAction>,
    pub actor: Option<Actor>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn for_object(object_id: impl Into<String>) -> Self {
        Self {
            object_id: Some(object_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref id) = self.object_id {
            if &event.object_id != id {
                return false;
            }
        }
        if let Some(t) = self.object_type {
            if event.object_type != t {
                return false;
            }
        }
        if let Some(a) = self.action {
            if event.action != a {
                return false;
            }
        }
        if let Some(ref actor) = self.actor {
            if &event.actor != actor {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// KV-backed append-only log with process-wide sequential ids.
pub struct AuditTrail {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    next_id: AtomicU64,
}

impl AuditTrail {
    /// Opens the trail, continuing the id sequence after any stored events.
    pub fn open(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Result<Self, LeaseError> {
        let last = scan_records::<AuditEvent>(kv.as_ref(), AUDIT_PREFIX)?
            .last()
            .map(|e| e.id)
            .unwrap_or(0);
        Ok(Self {
            kv,
            clock,
            next_id: AtomicU64::new(last + 1),
        })
    }

    fn stage(&self, record: AuditRecord) -> Result<(AuditEvent, BatchOp), LeaseError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = AuditEvent {
            id,
            timestamp: self.clock.now(),
            actor: record.actor,
            action: record.action,
            object_type: record.object_type,
            object_id: record.object_id,
            before: record.before,
            after: record.after,
            reason: record.reason,
        };
        let op = BatchOp::Put {
            key: audit_key(id),
            value: encode(&event)?,
        };
        Ok((event, op))
    }

    pub fn record(&self, record: AuditRecord) -> Result<AuditEvent, LeaseError> {
        self.commit(Vec::new(), record)
    }

    /// Applies `ops` and appends the event describing them in one atomic batch.
    ///
    /// The trail must share its store with the records being mutated.
    pub fn commit(&self, ops: Vec<BatchOp>, record: AuditRecord) -> Result<AuditEvent, LeaseError> {
        let mut events = self.commit_all(ops, vec![record])?;
        events
            .pop()
            .ok_or_else(|| LeaseError::Kv("audit batch produced no event".to_string()))
    }

    /// Like [`commit`](Self::commit) for a mutation described by several events.
    pub fn commit_all(
        &self,
        mut ops: Vec<BatchOp>,
        records: Vec<AuditRecord>,
    ) -> Result<Vec<AuditEvent>, LeaseError> {
        if let Some((record, e)) = records
            .iter()
            .find_map(|r| r.snapshot_error.as_ref().map(|e| (r, e)))
        {
            return Err(LeaseError::Codec(format!(
                "audit snapshot of {} failed: {}",
                record.object_id, e
            )));
        }
        let mut events = Vec::with_capacity(records.len());
        for record in records {
            let (event, op) = self.stage(record)?;
            ops.push(op);
            events.push(event);
        }
        self.kv.write_batch(ops)?;
        for event in &events {
            tracing::debug!(
                id = event.id,
                action = ?event.action,
                object_id = %event.object_id,
                "audit event appended"
            );
        }
        Ok(events)
    }

    /// Matching events in append order.
    pub fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, LeaseError> {
        let mut events: Vec<AuditEvent> = scan_records::<AuditEvent>(self.kv.as_ref(), AUDIT_PREFIX)?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        if let Some(limit) = filter.limit {
            if events.len() > limit {
                events.drain(..events.len() - limit);
            }
        }
        Ok(events)
    }

    pub fn event_count(&self) -> Result<usize, LeaseError> {
        Ok(self.kv.scan_prefix(AUDIT_PREFIX)?.len())
    }
}

fn audit_key(id: u64) -> Vec<u8> {
    let mut key = AUDIT_PREFIX.to_vec();
    key.extend_from_slice(format!("{:020}", id).as_bytes());
    key
}
