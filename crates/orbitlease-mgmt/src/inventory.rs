//! Static node and port inventory loaded from TOML at startup.

use orbitlease_core::{
    LeaseService, Node, NodeHealth, NodeId, Port, PortBudget, PortId, PortStatus, PortTelemetry,
    TenantId,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub nodes: Vec<InventoryNode>,
    #[serde(default)]
    pub ports: Vec<InventoryPort>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryNode {
    pub id: String,
    pub name: String,
    pub power_generation_max_w: f64,
    pub thermal_dissipation_max_w: f64,
    pub downlink_committed_mbps: f64,
    #[serde(default)]
    pub compute_units_max: f64,
    #[serde(default)]
    pub pointing_minutes_max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryPort {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub tenant_id: Option<String>,
    /// Defaults to ACTIVE when leased, AVAILABLE otherwise.
    pub status: Option<PortStatus>,
    #[serde(default)]
    pub budget: PortBudget,
}

impl InventoryNode {
    fn to_node(&self) -> Node {
        Node {
            id: NodeId::new(self.id.as_str()),
            name: self.name.clone(),
            power_generation_max_w: self.power_generation_max_w,
            thermal_dissipation_max_w: self.thermal_dissipation_max_w,
            downlink_committed_mbps: self.downlink_committed_mbps,
            compute_units_max: self.compute_units_max,
            pointing_minutes_max: self.pointing_minutes_max,
            health: NodeHealth::Nominal,
        }
    }
}

impl InventoryPort {
    fn to_port(&self) -> Port {
        let tenant_id = self.tenant_id.as_deref().map(TenantId::new);
        let status = self.status.unwrap_or(if tenant_id.is_some() {
            PortStatus::Active
        } else {
            PortStatus::Available
        });
        Port {
            id: PortId::new(self.id.as_str()),
            node_id: NodeId::new(self.node_id.as_str()),
            name: self.name.clone(),
            tenant_id,
            status,
            budget: self.budget.clone(),
            telemetry: PortTelemetry::default(),
        }
    }
}

impl Inventory {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let inventory: Inventory = toml::from_str(contents)?;
        for port in &inventory.ports {
            if !inventory.nodes.iter().any(|n| n.id == port.node_id) {
                anyhow::bail!("port {} references unknown node {}", port.id, port.node_id);
            }
        }
        Ok(inventory)
    }

    /// Registers every node, then every port. Existing records are overwritten.
    pub fn seed(&self, service: &LeaseService) -> anyhow::Result<()> {
        for node in &self.nodes {
            service.register_node(&node.to_node())?;
        }
        for port in &self.ports {
            service.register_port(&port.to_port())?;
        }
        tracing::info!(
            nodes = self.nodes.len(),
            ports = self.ports.len(),
            "inventory seeded"
        );
        Ok(())
    }
}
