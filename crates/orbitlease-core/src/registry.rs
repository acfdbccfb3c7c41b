//! Resource registry: nodes with static capacity ceilings and the ports
//! they lease to tenants.
//!
//! Nodes live under `node/{id}` and ports under `port/{id}`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kvstore::{decode, encode, record_key, scan_records, BatchOp, KvStore};
use crate::types::{HeartbeatStatus, LeaseError, NodeId, PortId, PortStatus, TenantId};

const NODE_PREFIX: &[u8] = b"node/";
const PORT_PREFIX: &[u8] = b"port/";

/// Coarse health of a node, maintained by operators.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    #[default]
    Nominal,
    Degraded,
    Maintenance,
    Offline,
}

/// A shared-infrastructure unit. Capacity ceilings never change after registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub power_generation_max_w: f64,
    pub thermal_dissipation_max_w: f64,
    pub downlink_committed_mbps: f64,
    pub compute_units_max: f64,
    pub pointing_minutes_max: f64,
    #[serde(default)]
    pub health: NodeHealth,
}

/// Per-port resource budget agreed with the lessee.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortBudget {
    pub power_avg_w: f64,
    pub power_peak_w: f64,
    pub thermal_w: f64,
    pub data_mbps: f64,
}

/// Last telemetry seen for a port.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PortTelemetry {
    pub power_draw_w: f64,
    pub temperature_c: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub data_rate_mbps: f64,
    pub data_error_rate: f64,
    pub heartbeat: HeartbeatStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub node_id: NodeId,
    pub name: String,
    pub tenant_id: Option<TenantId>,
    pub status: PortStatus,
    pub budget: PortBudget,
    #[serde(default)]
    pub telemetry: PortTelemetry,
}

/// KV-backed registry of nodes and ports.
pub struct ResourceRegistry {
    kv: Arc<dyn KvStore>,
}

impl ResourceRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn put_node(&self, node: &Node) -> Result<(), LeaseError> {
        self.kv
            .put(record_key(NODE_PREFIX, node.id.as_str()), encode(node)?)
    }

    pub fn find_node(&self, id: &NodeId) -> Result<Option<Node>, LeaseError> {
        match self.kv.get(&record_key(NODE_PREFIX, id.as_str()))? {
            Some(value) => Ok(Some(decode(&value)?)),
            None => Ok(None),
        }
    }

    pub fn get_node(&self, id: &NodeId) -> Result<Node, LeaseError> {
        self.find_node(id)?
            .ok_or_else(|| LeaseError::NodeNotFound(id.clone()))
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, LeaseError> {
        scan_records(self.kv.as_ref(), NODE_PREFIX)
    }

    /// Stores a port. The owning node must already be registered.
    pub fn put_port(&self, port: &Port) -> Result<(), LeaseError> {
        if !self
            .kv
            .contains_key(&record_key(NODE_PREFIX, port.node_id.as_str()))?
        {
            return Err(LeaseError::NodeNotFound(port.node_id.clone()));
        }
        self.kv.write_batch(vec![self.port_op(port)?])
    }

    /// Batch operation that writes `port`, for callers committing several records at once.
    pub(crate) fn port_op(&self, port: &Port) -> Result<BatchOp, LeaseError> {
        Ok(BatchOp::Put {
            key: record_key(PORT_PREFIX, port.id.as_str()),
            value: encode(port)?,
        })
    }

    pub fn get_port(&self, id: &PortId) -> Result<Port, LeaseError> {
        match self.kv.get(&record_key(PORT_PREFIX, id.as_str()))? {
            Some(value) => decode(&value),
            None => Err(LeaseError::PortNotFound(id.clone())),
        }
    }

    pub fn list_ports(&self) -> Result<Vec<Port>, LeaseError> {
        scan_records(self.kv.as_ref(), PORT_PREFIX)
    }

    pub fn ports_on_node(&self, node_id: &NodeId) -> Result<Vec<Port>, LeaseError> {
        Ok(self
            .list_ports()?
            .into_iter()
            .filter(|p| &p.node_id == node_id)
            .collect())
    }

    /// Replaces the live telemetry snapshot of a port, leaving its status untouched.
    pub fn record_telemetry(
        &self,
        id: &PortId,
        telemetry: PortTelemetry,
    ) -> Result<Port, LeaseError> {
        let mut port = self.get_port(id)?;
        port.telemetry = telemetry;
        self.kv.write_batch(vec![self.port_op(&port)?])?;
        Ok(port)
    }
}
