//! Common fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use orbitlease_core::{
    Clock, FaultRuleConfig, HeartbeatStatus, LeaseService, ManualClock, MemoryKvStore, Node,
    NodeHealth, NodeId, Port, PortBudget, PortId, PortStatus, PortTelemetry, PriorityTier,
    ReservationRequest, ResourceBundle, TelemetryPoint, TenantId,
};

/// One node with a fixed 5000 W power ceiling and a handful of ports.
pub struct TestPlatform {
    pub clock: Arc<ManualClock>,
    pub service: LeaseService,
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 14, 6, 0, 0).unwrap()
}

impl TestPlatform {
    pub fn new() -> Self {
        Self::with_ceilings(5000.0, 4000.0, 1000.0)
    }

    pub fn with_ceilings(power_w: f64, thermal_w: f64, downlink_mbps: f64) -> Self {
        let clock = Arc::new(ManualClock::new(epoch()));
        let service = LeaseService::new(
            Arc::new(MemoryKvStore::new()),
            clock.clone(),
            FaultRuleConfig::default(),
        )
        .unwrap();
        service
            .register_node(&Node {
                id: NodeId::new("sat-1"),
                name: "Sat 1".to_string(),
                power_generation_max_w: power_w,
                thermal_dissipation_max_w: thermal_w,
                downlink_committed_mbps: downlink_mbps,
                compute_units_max: 32.0,
                pointing_minutes_max: 1440.0,
                health: NodeHealth::Nominal,
            })
            .unwrap();
        for i in 1..=4 {
            service
                .register_port(&Port {
                    id: PortId::new(format!("sat-1-p{}", i)),
                    node_id: NodeId::new("sat-1"),
                    name: format!("Payload bay {}", i),
                    tenant_id: Some(TenantId::new("acme")),
                    status: PortStatus::Active,
                    budget: PortBudget {
                        power_avg_w: 1000.0,
                        power_peak_w: 1500.0,
                        thermal_w: 500.0,
                        data_mbps: 250.0,
                    },
                    telemetry: PortTelemetry::default(),
                })
                .unwrap();
        }
        Self { clock, service }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Request on `port` for `[now + start_h, now + start_h + hours)`.
    pub fn request(
        &self,
        port: &str,
        power_w: f64,
        priority: PriorityTier,
        preemptible: bool,
        start_h: i64,
        hours: i64,
    ) -> ReservationRequest {
        let start = self.now() + Duration::hours(start_h);
        ReservationRequest {
            tenant_id: TenantId::new("acme"),
            node_id: NodeId::new("sat-1"),
            port_id: Some(PortId::new(port)),
            start_time: start,
            end_time: start + Duration::hours(hours),
            resources: ResourceBundle {
                power_avg_w: power_w,
                power_peak_w: power_w,
                energy_budget_wh: power_w * hours as f64,
                thermal_w: 50.0,
                downlink_avg_mbps: 20.0,
                downlink_budget_mb: 0.0,
                compute_units: 1.0,
                pointing_minutes: 10.0,
            },
            priority,
            preemptible,
            created_by: "ops@acme".to_string(),
        }
    }

    pub fn telemetry(&self, port: &str, at: DateTime<Utc>) -> TelemetryPoint {
        TelemetryPoint {
            timestamp: at,
            port_id: PortId::new(port),
            node_id: NodeId::new("sat-1"),
            power_draw: 400.0,
            temperature: 30.0,
            voltage: 28.0,
            current: 14.3,
            data_rate: 100.0,
            data_error_rate: 0.0,
            heartbeat_status: HeartbeatStatus::Ok,
            simulated_over_temp: false,
        }
    }
}
