use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use orbitlease_core::{AuditEvent, Incident, IncidentStatus, Node, Reservation, SlaEvaluation};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "olm")]
#[command(about = "Orbitlease management CLI", long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "http://localhost:8470")]
    pub server: String,

    /// Recorded as the actor on mutations made through the CLI.
    #[arg(long, env = "OLM_ACTOR", default_value = "olm-cli")]
    pub actor: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Serve {
        #[arg(short, long, default_value = "/etc/orbitlease/olm.toml")]
        config: PathBuf,
    },
    Nodes,
    Incidents {
        #[arg(long, value_parser = parse_incident_status)]
        status: Option<IncidentStatus>,
    },
    Audit {
        object_id: String,
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    Sla {
        tenant: String,
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
        #[arg(long, default_value = "99.9")]
        promised: f64,
        #[arg(long, default_value = "0")]
        base_fee: f64,
    },
    Cancel {
        reservation_id: String,
        #[arg(short, long)]
        reason: Option<String>,
    },
}

fn parse_incident_status(s: &str) -> Result<IncidentStatus, String> {
    serde_json::from_value(serde_json::Value::String(s.to_uppercase()))
        .map_err(|_| format!("unknown incident status: {}", s))
}

fn rfc3339(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Serve { .. } => anyhow::bail!("serve is handled by the binary entry point"),
            Command::Nodes => self.nodes().await,
            Command::Incidents { status } => self.incidents(status).await,
            Command::Audit {
                ref object_id,
                limit,
            } => self.audit(object_id, limit).await,
            Command::Sla {
                ref tenant,
                from,
                to,
                promised,
                base_fee,
            } => self.sla(tenant, from, to, promised, base_fee).await,
            Command::Cancel {
                ref reservation_id,
                ref reason,
            } => self.cancel(reservation_id, reason.as_deref()).await,
        }
    }

    async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Request failed: {} {}", status, body);
        }
        Ok(response.json().await?)
    }

    async fn nodes(&self) -> Result<()> {
        let client = Client::new();
        let url = format!("{}/api/v1/nodes", self.server);
        let nodes: Vec<Node> = Self::send_json(client.get(&url)).await?;

        println!(
            "{:<16} {:<24} {:>10} {:>10} {:>12} {:<10}",
            "NODE ID", "NAME", "POWER W", "THERMAL W", "DOWNLINK", "HEALTH"
        );
        println!("{}", "-".repeat(87));
        for node in nodes {
            println!(
                "{:<16} {:<24} {:>10.0} {:>10.0} {:>12.0} {:<10}",
                node.id,
                node.name,
                node.power_generation_max_w,
                node.thermal_dissipation_max_w,
                node.downlink_committed_mbps,
                format!("{:?}", node.health)
            );
        }
        Ok(())
    }

    async fn incidents(&self, status: Option<IncidentStatus>) -> Result<()> {
        let client = Client::new();
        let url = format!("{}/api/v1/incidents", self.server);
        let mut request = client.get(&url);
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }
        let incidents: Vec<Incident> = Self::send_json(request).await?;

        println!(
            "{:<40} {:<16} {:<15} {:<20} {:<20}",
            "INCIDENT", "RULE", "STATUS", "PORTS", "OPENED"
        );
        println!("{}", "-".repeat(111));
        for incident in incidents {
            let ports: Vec<&str> = incident.port_ids.iter().map(|p| p.as_str()).collect();
            println!(
                "{:<40} {:<16} {:<15} {:<20} {:<20}",
                incident.id,
                incident.rule,
                incident.status,
                ports.join(","),
                rfc3339(&incident.opened_at)
            );
        }
        Ok(())
    }

    async fn audit(&self, object_id: &str, limit: usize) -> Result<()> {
        let client = Client::new();
        let url = format!("{}/api/v1/audit", self.server);
        let request = client.get(&url).query(&[
            ("object_id", object_id.to_string()),
            ("limit", limit.to_string()),
        ]);
        let events: Vec<AuditEvent> = Self::send_json(request).await?;

        for event in events {
            println!(
                "#{:<6} {} {:?} {:?} {}",
                event.id,
                rfc3339(&event.timestamp),
                event.action,
                event.actor,
                event.reason.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn sla(
        &self,
        tenant: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        promised: f64,
        base_fee: f64,
    ) -> Result<()> {
        let client = Client::new();
        let url = format!("{}/api/v1/tenants/{}/sla", self.server, tenant);
        let request = client.get(&url).query(&[
            ("from", rfc3339(&from)),
            ("to", rfc3339(&to)),
            ("promised_uptime_pct", promised.to_string()),
            ("base_fee", base_fee.to_string()),
        ]);
        let sla: SlaEvaluation = Self::send_json(request).await?;

        println!("Tenant: {}", sla.tenant_id);
        println!("Period: {} .. {}", rfc3339(&sla.from), rfc3339(&sla.to));
        println!("Promised uptime: {:.3}%", sla.promised_uptime_pct);
        println!("Actual uptime: {:.3}%", sla.actual_uptime_pct);
        println!(
            "Delivered: {:.1} of {:.1} minutes",
            sla.delivered_minutes, sla.requested_minutes
        );
        println!("Incident downtime: {:.1} minutes", sla.downtime_minutes);
        println!("Open incidents: {}", sla.open_incidents);
        println!("Met: {}", if sla.met { "yes" } else { "no" });
        println!("Credit: {:.2}", sla.credit);
        Ok(())
    }

    async fn cancel(&self, reservation_id: &str, reason: Option<&str>) -> Result<()> {
        let client = Client::new();
        let url = format!(
            "{}/api/v1/reservations/{}/cancel",
            self.server, reservation_id
        );
        let body = serde_json::json!({
            "actor": self.actor,
            "reason": reason,
        });
        let reservation: Reservation = Self::send_json(client.post(&url).json(&body)).await?;

        println!("Reservation: {}", reservation.id);
        println!("Status: {}", reservation.status);
        if let Some(reason) = reservation.status_reason {
            println!("Reason: {}", reason);
        }
        Ok(())
    }
}
