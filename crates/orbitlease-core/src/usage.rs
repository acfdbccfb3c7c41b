//! Per-tenant usage rollups and SLA credit evaluation.
//!
//! Daily [`UsageRecord`]s are derived from `COMPLETED` and `IN_PROGRESS`
//! reservations, prorated over the calendar days (UTC) they span. Once
//! materialized they are stored under `usage/{tenant}/{day}`; a stored day
//! is preferred over re-derivation and unstored days are derived.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{Actor, AuditAction, AuditRecord, ObjectType};
use crate::kvstore::{encode, record_key, scan_records, BatchOp, KvStore};
use crate::reservation::Reservation;
use crate::service::Stores;
use crate::types::{IncidentStatus, LeaseError, ReservationStatus, TenantId};

const USAGE_PREFIX: &[u8] = b"usage/";

/// Shortfall step, in percentage points, that earns one percent of the fee.
const CREDIT_STEP_PCT: f64 = 0.1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: TenantId,
    pub day: NaiveDate,
    pub energy_wh: f64,
    pub peak_power_w: f64,
    pub thermal_wh: f64,
    pub downlink_mb: f64,
    pub compute_unit_hours: f64,
    pub pointing_minutes: f64,
    pub reservation_minutes_requested: f64,
    pub reservation_minutes_delivered: f64,
    pub reservation_count: u32,
    /// Set once the record has been stored.
    pub materialized_at: Option<DateTime<Utc>>,
}

impl UsageRecord {
    fn empty(tenant_id: TenantId, day: NaiveDate) -> Self {
        Self {
            tenant_id,
            day,
            energy_wh: 0.0,
            peak_power_w: 0.0,
            thermal_wh: 0.0,
            downlink_mb: 0.0,
            compute_unit_hours: 0.0,
            pointing_minutes: 0.0,
            reservation_minutes_requested: 0.0,
            reservation_minutes_delivered: 0.0,
            reservation_count: 0,
            materialized_at: None,
        }
    }

    fn key_id(&self) -> String {
        format!("{}/{}", self.tenant_id, self.day)
    }
}

pub struct UsageStore {
    kv: Arc<dyn KvStore>,
}

impl UsageStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub(crate) fn put_op(&self, record: &UsageRecord) -> Result<BatchOp, LeaseError> {
        Ok(BatchOp::Put {
            key: record_key(USAGE_PREFIX, &record.key_id()),
            value: encode(record)?,
        })
    }

    /// Stored records for `tenant` with `first <= day <= last`, ordered by day.
    pub fn for_tenant(
        &self,
        tenant: &TenantId,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<Vec<UsageRecord>, LeaseError> {
        let prefix = record_key(USAGE_PREFIX, &format!("{}/", tenant));
        Ok(scan_records::<UsageRecord>(self.kv.as_ref(), &prefix)?
            .into_iter()
            .filter(|r| r.day >= first && r.day <= last)
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlaTerms {
    pub promised_uptime_pct: f64,
    pub base_fee: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlaEvaluation {
    pub tenant_id: TenantId,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub promised_uptime_pct: f64,
    pub actual_uptime_pct: f64,
    pub requested_minutes: f64,
    pub delivered_minutes: f64,
    pub downtime_minutes: f64,
    pub open_incidents: usize,
    pub met: bool,
    pub credit: f64,
}

pub struct UsageAggregator {
    stores: Stores,
}

impl UsageAggregator {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Daily usage over `[from, to)`, ordered by day. A stored record wins
    /// for its day; days never materialized are derived.
    pub fn aggregate_usage(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, LeaseError> {
        let (first, last) = day_range(from, to)?;
        let mut days: BTreeMap<NaiveDate, UsageRecord> = self
            .stores
            .usage
            .for_tenant(tenant, first, last)?
            .into_iter()
            .map(|r| (r.day, r))
            .collect();
        for record in self.derive(tenant, from, to)? {
            days.entry(record.day).or_insert(record);
        }
        Ok(days.into_values().collect())
    }

    /// Derives daily records over `[from, to)` and stores them.
    pub fn materialize_usage(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, LeaseError> {
        let now = self.stores.clock.now();
        let mut records = self.derive(tenant, from, to)?;
        if records.is_empty() {
            return Ok(records);
        }

        let mut ops = Vec::with_capacity(records.len());
        let mut audit = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            record.materialized_at = Some(now);
            ops.push(self.stores.usage.put_op(record)?);
            audit.push(
                AuditRecord::new(
                    Actor::System,
                    AuditAction::UsageMaterialized,
                    ObjectType::UsageRecord,
                    record.key_id(),
                )
                .after(&*record),
            );
        }
        self.stores.audit.commit_all(ops, audit)?;
        tracing::info!(tenant_id = %tenant, days = records.len(), "usage materialized");
        Ok(records)
    }

    fn derive(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, LeaseError> {
        day_range(from, to)?;
        let now = self.stores.clock.now();
        let mut days: BTreeMap<NaiveDate, UsageRecord> = BTreeMap::new();

        for reservation in self.stores.reservations.for_tenant(tenant)? {
            let delivered_until = match reservation.status {
                ReservationStatus::Completed => reservation.end,
                ReservationStatus::InProgress => reservation.end.min(now),
                _ => continue,
            };
            let full_minutes = minutes(reservation.duration());
            if full_minutes <= 0.0 {
                continue;
            }
            let Some((start, end)) = clip(reservation.start, reservation.end, from, to) else {
                continue;
            };

            for (day, day_start, day_end) in days_between(start, end) {
                let requested = minutes(day_end - day_start);
                let delivered = clip(day_start, day_end, reservation.start, delivered_until)
                    .map(|(s, e)| minutes(e - s))
                    .unwrap_or(0.0);
                let record = days
                    .entry(day)
                    .or_insert_with(|| UsageRecord::empty(tenant.clone(), day));
                accumulate(record, &reservation, requested, delivered, full_minutes);
            }
        }
        Ok(days.into_values().collect())
    }

    /// Uptime and credit for `tenant` over `[from, to)`.
    ///
    /// Requested time is each reservation's window clipped to the period.
    /// Delivered time credits `COMPLETED` in full, `IN_PROGRESS` for the
    /// elapsed part, `AT_RISK` at half and `FAILED`, `PREEMPTED` or
    /// cancelled-by-preemption not at all,
    /// less a severity-weighted estimate for the tenant's open incidents
    /// opened in the period. The credit never exceeds the base fee.
    pub fn evaluate_sla(
        &self,
        tenant: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        terms: &SlaTerms,
    ) -> Result<SlaEvaluation, LeaseError> {
        day_range(from, to)?;
        let now = self.stores.clock.now();

        let mut requested = 0.0;
        let mut delivered = 0.0;
        for r in self.stores.reservations.for_tenant(tenant)? {
            let Some((start, end)) = clip(r.start, r.end, from, to) else {
                continue;
            };
            let window = minutes(end - start);
            let credited = match r.status {
                ReservationStatus::Completed => window,
                ReservationStatus::InProgress => clip(start, end, start, now)
                    .map(|(s, e)| minutes(e - s))
                    .unwrap_or(0.0),
                ReservationStatus::AtRisk => window * 0.5,
                ReservationStatus::Failed | ReservationStatus::Preempted => 0.0,
                ReservationStatus::Cancelled if r.was_preempted() => 0.0,
                _ => continue,
            };
            requested += window;
            delivered += credited;
        }

        let open: Vec<_> = self
            .stores
            .incidents
            .with_status(IncidentStatus::Open)?
            .into_iter()
            .filter(|i| i.tenant_id.as_ref() == Some(tenant))
            .filter(|i| i.opened_at >= from && i.opened_at < to)
            .collect();
        let downtime: f64 = open.iter().map(|i| i.severity.downtime_minutes()).sum();
        let delivered = (delivered - downtime).max(0.0);

        let actual = if requested > 0.0 {
            delivered / requested * 100.0
        } else {
            100.0
        };
        let met = actual >= terms.promised_uptime_pct;
        let credit = if met {
            0.0
        } else {
            let shortfall = terms.promised_uptime_pct - actual;
            ((shortfall / CREDIT_STEP_PCT) * (terms.base_fee * 0.01)).min(terms.base_fee)
        };
        if !met {
            tracing::info!(
                tenant_id = %tenant,
                promised = terms.promised_uptime_pct,
                actual,
                credit,
                "SLA missed"
            );
        }

        Ok(SlaEvaluation {
            tenant_id: tenant.clone(),
            from,
            to,
            promised_uptime_pct: terms.promised_uptime_pct,
            actual_uptime_pct: actual,
            requested_minutes: requested,
            delivered_minutes: delivered,
            downtime_minutes: downtime,
            open_incidents: open.len(),
            met,
            credit,
        })
    }
}

fn accumulate(
    record: &mut UsageRecord,
    r: &Reservation,
    requested_minutes: f64,
    delivered_minutes: f64,
    full_minutes: f64,
) {
    let hours = delivered_minutes / 60.0;
    let res = &r.resources;
    record.energy_wh += res.power_avg_w * hours;
    record.thermal_wh += res.thermal_w * hours;
    record.downlink_mb += res.downlink_avg_mbps * hours * 3600.0 / 8.0;
    record.compute_unit_hours += res.compute_units * hours;
    record.pointing_minutes += res.pointing_minutes * (delivered_minutes / full_minutes);
    if delivered_minutes > 0.0 {
        record.peak_power_w = record.peak_power_w.max(res.power_peak_w);
    }
    record.reservation_minutes_requested += requested_minutes;
    record.reservation_minutes_delivered += delivered_minutes;
    record.reservation_count += 1;
}

fn minutes(d: Duration) -> f64 {
    d.num_seconds() as f64 / 60.0
}

/// Intersection of `[a_start, a_end)` and `[b_start, b_end)`, if non-empty.
fn clip(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    (start < end).then_some((start, end))
}

/// First and last calendar day touched by `[from, to)`.
fn day_range(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(NaiveDate, NaiveDate), LeaseError> {
    if to <= from {
        return Err(LeaseError::InvalidWindow {
            start: from,
            end: to,
        });
    }
    Ok((from.date_naive(), (to - Duration::nanoseconds(1)).date_naive()))
}

/// Splits `[start, end)` at UTC midnights.
fn days_between(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(NaiveDate, DateTime<Utc>, DateTime<Utc>)> {
    let mut slices = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let day = cursor.date_naive();
        let next_midnight = day
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or(end);
        let slice_end = next_midnight.min(end);
        slices.push((day, cursor, slice_end));
        cursor = slice_end;
    }
    slices
}
