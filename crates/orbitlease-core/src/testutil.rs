//! Shared unit-test fixture: one node `n1` (5000 W, 3000 W thermal,
//! 1000 Mbps) with port `p1` leased to `acme` and unleased port `p2`.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::arbiter::ReservationArbiter;
use crate::clock::{Clock, ManualClock};
use crate::fault::FaultRuleConfig;
use crate::kvstore::MemoryKvStore;
use crate::registry::{Node, NodeHealth, Port, PortBudget, PortTelemetry};
use crate::reservation::{ReservationRequest, ResourceBundle};
use crate::service::{LeaseService, Stores};
use crate::types::{NodeId, PortId, PortStatus, PriorityTier, TenantId};

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub service: LeaseService,
    pub stores: Stores,
    pub arbiter: ReservationArbiter,
}

impl Fixture {
    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn set_port_status(&self, port: &str, status: PortStatus) {
        let mut p = self.stores.registry.get_port(&PortId::new(port)).unwrap();
        p.status = status;
        self.stores.registry.put_port(&p).unwrap();
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
}

pub fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(start_time()));
    let service = LeaseService::new(
        Arc::new(MemoryKvStore::new()),
        clock.clone(),
        FaultRuleConfig::default(),
    )
    .unwrap();
    service
        .register_node(&Node {
            id: NodeId::new("n1"),
            name: "Node One".to_string(),
            power_generation_max_w: 5000.0,
            thermal_dissipation_max_w: 3000.0,
            downlink_committed_mbps: 1000.0,
            compute_units_max: 64.0,
            pointing_minutes_max: 1440.0,
            health: NodeHealth::Nominal,
        })
        .unwrap();
    for (id, tenant, status) in [
        ("p1", Some("acme"), PortStatus::Active),
        ("p2", None, PortStatus::Available),
    ] {
        service
            .register_port(&Port {
                id: PortId::new(id),
                node_id: NodeId::new("n1"),
                name: id.to_uppercase(),
                tenant_id: tenant.map(TenantId::new),
                status,
                budget: PortBudget {
                    power_avg_w: 800.0,
                    power_peak_w: 1200.0,
                    thermal_w: 400.0,
                    data_mbps: 200.0,
                },
                telemetry: PortTelemetry::default(),
            })
            .unwrap();
    }
    let stores = service.stores().clone();
    Fixture {
        arbiter: ReservationArbiter::new(stores.clone()),
        clock,
        service,
        stores,
    }
}

pub fn bundle(power_w: f64) -> ResourceBundle {
    ResourceBundle {
        power_avg_w: power_w,
        power_peak_w: power_w * 1.2,
        energy_budget_wh: power_w * 2.0,
        thermal_w: 10.0,
        downlink_avg_mbps: 10.0,
        downlink_budget_mb: 9000.0,
        compute_units: 1.0,
        pointing_minutes: 30.0,
    }
}

/// A request by `acme` on `n1`, starting one hour from the fixture clock and lasting two hours.
pub fn request_on(
    fx: &Fixture,
    port: &str,
    resources: ResourceBundle,
    priority: PriorityTier,
    preemptible: bool,
) -> ReservationRequest {
    let start = fx.clock_now() + Duration::hours(1);
    ReservationRequest {
        tenant_id: TenantId::new("acme"),
        node_id: NodeId::new("n1"),
        port_id: Some(PortId::new(port)),
        start_time: start,
        end_time: start + Duration::hours(2),
        resources,
        priority,
        preemptible,
        created_by: "acme-ops".to_string(),
    }
}
