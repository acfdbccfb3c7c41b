use crate::config::MgmtConfig;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use orbitlease_core::{
    Actor, ArbiterResult, AuditEvent, AuditFilter, CapacitySnapshot, Incident, IncidentId,
    IncidentStatus, LeaseError, LeaseService, Node, NodeId, Port, PortAction, PortId, Reservation,
    ReservationId, ReservationRequest, ReservationUpdate, SlaEvaluation, SlaTerms, TelemetryPoint,
    TenantId, UsageRecord,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tower_http::trace::TraceLayer;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("telemetry queue is full")]
    QueueFull,

    #[error("telemetry ingest is not running")]
    IngestStopped,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Lease(err) => match err {
                LeaseError::NodeNotFound(_)
                | LeaseError::PortNotFound(_)
                | LeaseError::ReservationNotFound(_)
                | LeaseError::IncidentNotFound(_) => StatusCode::NOT_FOUND,
                LeaseError::InvalidTransition { .. } => StatusCode::CONFLICT,
                LeaseError::InvalidWindow { .. } => StatusCode::BAD_REQUEST,
                LeaseError::Kv(_) | LeaseError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::QueueFull | ApiError::IngestStopped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "admin API request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SlaQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub promised_uptime_pct: f64,
    pub base_fee: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReservationQuery {
    pub tenant_id: Option<String>,
    pub node_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IncidentQuery {
    pub status: Option<IncidentStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub object_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PortActionBody {
    pub action: PortAction,
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModifyBody {
    #[serde(flatten)]
    pub update: ReservationUpdate,
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub actor: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    pub status: IncidentStatus,
    pub actor: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone)]
pub struct AdminApi {
    service: Arc<LeaseService>,
    telemetry_tx: mpsc::Sender<TelemetryPoint>,
    config: Arc<MgmtConfig>,
}

impl AdminApi {
    pub fn new(
        service: Arc<LeaseService>,
        telemetry_tx: mpsc::Sender<TelemetryPoint>,
        config: Arc<MgmtConfig>,
    ) -> Self {
        Self {
            service,
            telemetry_tx,
            config,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/api/v1/nodes", get(nodes_list_handler))
            .route("/api/v1/nodes/:id/capacity", get(node_capacity_handler))
            .route("/api/v1/ports/:id", get(port_get_handler))
            .route("/api/v1/ports/:id/actions", post(port_action_handler))
            .route(
                "/api/v1/reservations",
                get(reservations_list_handler).post(reservation_admit_handler),
            )
            .route(
                "/api/v1/reservations/:id",
                get(reservation_get_handler).patch(reservation_modify_handler),
            )
            .route("/api/v1/reservations/:id/cancel", post(reservation_cancel_handler))
            .route("/api/v1/telemetry", post(telemetry_handler))
            .route("/api/v1/incidents", get(incidents_list_handler))
            .route("/api/v1/incidents/:id", get(incident_get_handler))
            .route("/api/v1/incidents/:id/transition", post(incident_transition_handler))
            .route("/api/v1/audit", get(audit_handler))
            .route("/api/v1/tenants/:id/usage", get(usage_handler))
            .route(
                "/api/v1/tenants/:id/usage/materialize",
                post(usage_materialize_handler),
            )
            .route("/api/v1/tenants/:id/sla", get(sla_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Admin API listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn nodes_list_handler(State(state): State<Arc<AdminApi>>) -> ApiResult<Vec<Node>> {
    Ok(Json(state.service.list_nodes()?))
}

async fn node_capacity_handler(
    State(state): State<Arc<AdminApi>>,
    Path(node_id): Path<String>,
    Query(window): Query<WindowQuery>,
) -> ApiResult<CapacitySnapshot> {
    let snapshot =
        state
            .service
            .available_capacity(&NodeId::new(node_id), window.start, window.end)?;
    Ok(Json(snapshot))
}

async fn port_get_handler(
    State(state): State<Arc<AdminApi>>,
    Path(port_id): Path<String>,
) -> ApiResult<Port> {
    Ok(Json(state.service.get_port(&PortId::new(port_id))?))
}

async fn port_action_handler(
    State(state): State<Arc<AdminApi>>,
    Path(port_id): Path<String>,
    Json(body): Json<PortActionBody>,
) -> ApiResult<Port> {
    let port = state.service.apply_port_action(
        &PortId::new(port_id),
        body.action,
        &Actor::user(body.actor),
        body.reason.as_deref(),
    )?;
    Ok(Json(port))
}

async fn reservation_admit_handler(
    State(state): State<Arc<AdminApi>>,
    Json(request): Json<ReservationRequest>,
) -> ApiResult<ArbiterResult> {
    Ok(Json(state.service.admit(&request)?))
}

async fn reservations_list_handler(
    State(state): State<Arc<AdminApi>>,
    Query(query): Query<ReservationQuery>,
) -> ApiResult<Vec<Reservation>> {
    let tenant = query.tenant_id.map(TenantId::new);
    let node = query.node_id.map(NodeId::new);
    let reservations = state
        .service
        .list_reservations(tenant.as_ref(), node.as_ref())?;
    Ok(Json(reservations))
}

async fn reservation_get_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<String>,
) -> ApiResult<Reservation> {
    Ok(Json(state.service.get_reservation(&ReservationId::new(id))?))
}

async fn reservation_modify_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<String>,
    Json(body): Json<ModifyBody>,
) -> ApiResult<ArbiterResult> {
    let result = state.service.modify(
        &ReservationId::new(id),
        &body.update,
        &Actor::user(body.actor),
    )?;
    Ok(Json(result))
}

async fn reservation_cancel_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<String>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Reservation> {
    let reason = body
        .reason
        .unwrap_or_else(|| format!("Cancelled by {}", body.actor));
    let reservation =
        state
            .service
            .cancel(&ReservationId::new(id), &Actor::user(body.actor), &reason)?;
    Ok(Json(reservation))
}

async fn telemetry_handler(
    State(state): State<Arc<AdminApi>>,
    Json(point): Json<TelemetryPoint>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    match state.telemetry_tx.try_send(point) {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "queued" })),
        )),
        Err(TrySendError::Full(point)) => {
            tracing::warn!(port_id = %point.port_id, "telemetry queue full, dropping point");
            Err(ApiError::QueueFull)
        }
        Err(TrySendError::Closed(_)) => Err(ApiError::IngestStopped),
    }
}

async fn incidents_list_handler(
    State(state): State<Arc<AdminApi>>,
    Query(query): Query<IncidentQuery>,
) -> ApiResult<Vec<Incident>> {
    Ok(Json(state.service.list_incidents(query.status)?))
}

async fn incident_get_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<String>,
) -> ApiResult<Incident> {
    Ok(Json(state.service.get_incident(&IncidentId::new(id))?))
}

async fn incident_transition_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<String>,
    Json(body): Json<TransitionBody>,
) -> ApiResult<Incident> {
    let incident = state.service.transition_incident(
        &IncidentId::new(id),
        body.status,
        &Actor::user(body.actor),
        body.note.as_deref(),
    )?;
    Ok(Json(incident))
}

async fn audit_handler(
    State(state): State<Arc<AdminApi>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Vec<AuditEvent>> {
    let filter = AuditFilter {
        object_id: query.object_id,
        limit: query.limit,
        ..AuditFilter::default()
    };
    Ok(Json(state.service.query_audit(&filter)?))
}

async fn usage_handler(
    State(state): State<Arc<AdminApi>>,
    Path(tenant_id): Path<String>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<Vec<UsageRecord>> {
    let records =
        state
            .service
            .aggregate_usage(&TenantId::new(tenant_id), period.from, period.to)?;
    Ok(Json(records))
}

async fn usage_materialize_handler(
    State(state): State<Arc<AdminApi>>,
    Path(tenant_id): Path<String>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<Vec<UsageRecord>> {
    let records =
        state
            .service
            .materialize_usage(&TenantId::new(tenant_id), period.from, period.to)?;
    Ok(Json(records))
}

async fn sla_handler(
    State(state): State<Arc<AdminApi>>,
    Path(tenant_id): Path<String>,
    Query(query): Query<SlaQuery>,
) -> ApiResult<SlaEvaluation> {
    let terms = SlaTerms {
        promised_uptime_pct: query.promised_uptime_pct,
        base_fee: query.base_fee,
    };
    let evaluation = state.service.evaluate_sla(
        &TenantId::new(tenant_id),
        query.from,
        query.to,
        &terms,
    )?;
    Ok(Json(evaluation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Inventory;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use orbitlease_core::{FaultRuleConfig, HeartbeatStatus, ManualClock, MemoryKvStore};
    use tower::ServiceExt;

    const INVENTORY: &str = r#"
[[nodes]]
id = "sat-1"
name = "Orbiter One"
power_generation_max_w = 5000.0
thermal_dissipation_max_w = 4000.0
downlink_committed_mbps = 1000.0

[[ports]]
id = "sat-1-p1"
node_id = "sat-1"
name = "Bay 1"
tenant_id = "acme"

[ports.budget]
power_avg_w = 800.0
power_peak_w = 1500.0
thermal_w = 600.0
data_mbps = 200.0
"#;

    struct Harness {
        service: Arc<LeaseService>,
        rx: mpsc::Receiver<TelemetryPoint>,
        router: Router,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 14, 6, 0, 0).unwrap()
    }

    fn harness_with_queue(depth: usize) -> Harness {
        let clock = Arc::new(ManualClock::new(now()));
        let service = Arc::new(
            LeaseService::new(
                Arc::new(MemoryKvStore::new()),
                clock,
                FaultRuleConfig::default(),
            )
            .unwrap(),
        );
        Inventory::parse(INVENTORY).unwrap().seed(&service).unwrap();
        let (tx, rx) = mpsc::channel(depth);
        let api = AdminApi::new(service.clone(), tx, Arc::new(MgmtConfig::default()));
        Harness {
            service,
            rx,
            router: Arc::new(api).router(),
        }
    }

    fn harness() -> Harness {
        harness_with_queue(16)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn reservation_body(power_w: f64) -> serde_json::Value {
        serde_json::json!({
            "tenant_id": "acme",
            "node_id": "sat-1",
            "port_id": "sat-1-p1",
            "start_time": "2026-07-14T08:00:00Z",
            "end_time": "2026-07-14T10:00:00Z",
            "resources": {
                "power_avg_w": power_w,
                "power_peak_w": power_w,
                "energy_budget_wh": power_w * 2.0,
                "thermal_w": 100.0,
                "downlink_avg_mbps": 50.0,
                "downlink_budget_mb": 1000.0,
                "compute_units": 1.0,
                "pointing_minutes": 10.0
            },
            "priority": "P2",
            "preemptible": false,
            "created_by": "acme-ops"
        })
    }

    fn telemetry(temperature: f64, simulated_over_temp: bool) -> TelemetryPoint {
        TelemetryPoint {
            timestamp: now(),
            port_id: PortId::new("sat-1-p1"),
            node_id: NodeId::new("sat-1"),
            power_draw: 400.0,
            temperature,
            voltage: 28.0,
            current: 10.0,
            data_rate: 50.0,
            data_error_rate: 0.0,
            heartbeat_status: HeartbeatStatus::Ok,
            simulated_over_temp,
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let h = harness();
        let (status, json) = send(&h.router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_nodes_list() {
        let h = harness();
        let (status, json) = send(&h.router, "GET", "/api/v1/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["id"], "sat-1");
    }

    #[tokio::test]
    async fn test_admit_and_list_reservations() {
        let h = harness();
        let (status, json) = send(
            &h.router,
            "POST",
            "/api/v1/reservations",
            Some(reservation_body(1200.0)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ACCEPTED");
        assert_eq!(json["reservation"]["status"], "ACCEPTED");

        let (status, json) = send(
            &h.router,
            "GET",
            "/api/v1/reservations?tenant_id=acme",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);

        let (_, json) = send(
            &h.router,
            "GET",
            "/api/v1/reservations?tenant_id=globex",
            None,
        )
        .await;
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_is_ok_with_reason() {
        let h = harness();
        let (status, json) = send(
            &h.router,
            "POST",
            "/api/v1/reservations",
            Some(reservation_body(9000.0)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "REJECTED");
        assert_eq!(json["reason"], "INSUFFICIENT_POWER");
        assert!(json.get("reservation").is_none());
    }

    #[tokio::test]
    async fn test_cancel_twice_conflicts() {
        let h = harness();
        let (_, json) = send(
            &h.router,
            "POST",
            "/api/v1/reservations",
            Some(reservation_body(500.0)),
        )
        .await;
        let id = json["reservation"]["id"].as_str().unwrap().to_string();
        let uri = format!("/api/v1/reservations/{}/cancel", id);
        let body = serde_json::json!({ "actor": "acme-ops" });

        let (status, json) = send(&h.router, "POST", &uri, Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "CANCELLED");

        let (status, _) = send(&h.router, "POST", &uri, Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_modify_reservation() {
        let h = harness();
        let (_, json) = send(
            &h.router,
            "POST",
            "/api/v1/reservations",
            Some(reservation_body(500.0)),
        )
        .await;
        let id = json["reservation"]["id"].as_str().unwrap().to_string();

        let (status, json) = send(
            &h.router,
            "PATCH",
            &format!("/api/v1/reservations/{}", id),
            Some(serde_json::json!({
                "actor": "acme-ops",
                "end_time": "2026-07-14T12:00:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ACCEPTED");

        let stored = h.service.get_reservation(&ReservationId::new(id)).unwrap();
        assert_eq!(
            stored.end,
            Utc.with_ymd_and_hms(2026, 7, 14, 12, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_port_is_not_found() {
        let h = harness();
        let (status, json) = send(&h.router, "GET", "/api/v1/ports/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_capacity_invalid_window() {
        let h = harness();
        let (status, _) = send(
            &h.router,
            "GET",
            "/api/v1/nodes/sat-1/capacity?start=2026-07-14T10:00:00Z&end=2026-07-14T08:00:00Z",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(
            &h.router,
            "GET",
            "/api/v1/nodes/sat-1/capacity?start=2026-07-14T08:00:00Z&end=2026-07-14T10:00:00Z",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["power_w"], 5000.0);
    }

    #[tokio::test]
    async fn test_port_action_is_audited() {
        let h = harness();
        let (status, json) = send(
            &h.router,
            "POST",
            "/api/v1/ports/sat-1-p1/actions",
            Some(serde_json::json!({
                "action": "CUT_POWER",
                "actor": "ops-lead",
                "reason": "arcing"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "POWER_CUT");

        let (status, json) = send(
            &h.router,
            "GET",
            "/api/v1/audit?object_id=sat-1-p1&limit=5",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let events = json.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["action"], "PORT_ACTION_APPLIED");
    }

    #[tokio::test]
    async fn test_telemetry_is_enqueued() {
        let mut h = harness();
        let point = telemetry(30.0, false);
        let (status, _) = send(
            &h.router,
            "POST",
            "/api/v1/telemetry",
            Some(serde_json::to_value(&point).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(h.rx.recv().await.unwrap(), point);
    }

    #[tokio::test]
    async fn test_full_telemetry_queue_is_unavailable() {
        let h = harness_with_queue(1);
        let body = serde_json::to_value(telemetry(30.0, false)).unwrap();
        let (first, _) = send(&h.router, "POST", "/api/v1/telemetry", Some(body.clone())).await;
        let (second, _) = send(&h.router, "POST", "/api/v1/telemetry", Some(body)).await;
        assert_eq!(first, StatusCode::ACCEPTED);
        assert_eq!(second, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_incident_transitions() {
        let h = harness();
        let outcome = h
            .service
            .ingest_telemetry(&telemetry(70.0, true))
            .unwrap()
            .unwrap();
        let incident_id = outcome.fired[0].incident_id.to_string();

        let (status, json) = send(&h.router, "GET", "/api/v1/incidents?status=OPEN", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);

        let uri = format!("/api/v1/incidents/{}/transition", incident_id);
        let (status, json) = send(
            &h.router,
            "POST",
            &uri,
            Some(serde_json::json!({ "status": "ACK", "actor": "ops-lead" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ACK");
        assert!(json["acknowledged_at"].is_string());

        let (status, _) = send(
            &h.router,
            "POST",
            &uri,
            Some(serde_json::json!({ "status": "OPEN", "actor": "ops-lead" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_sla_and_usage_endpoints() {
        let h = harness();
        let (status, json) = send(
            &h.router,
            "GET",
            "/api/v1/tenants/acme/sla?from=2026-07-13T00:00:00Z&to=2026-07-14T00:00:00Z&promised_uptime_pct=99.9&base_fee=1000",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tenant_id"], "acme");
        assert_eq!(json["promised_uptime_pct"], 99.9);

        let (status, json) = send(
            &h.router,
            "GET",
            "/api/v1/tenants/acme/usage?from=2026-07-13T00:00:00Z&to=2026-07-14T00:00:00Z",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.is_array());
    }
}
