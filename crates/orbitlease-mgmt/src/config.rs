use orbitlease_core::{FaultRuleConfig, MAX_SUSTAIN_SECS};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    pub bind_addr: SocketAddr,
    /// TOML file of nodes and ports seeded into the registry at start.
    pub inventory_path: Option<PathBuf>,
    pub telemetry_queue_depth: usize,
    pub lifecycle_interval_secs: u64,
    pub log_format: LogFormat,
    pub fault_rules: FaultRuleConfig,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8470)),
            inventory_path: None,
            telemetry_queue_depth: 1024,
            lifecycle_interval_secs: 30,
            log_format: LogFormat::Text,
            fault_rules: FaultRuleConfig::default(),
        }
    }
}

impl MgmtConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: MgmtConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telemetry_queue_depth == 0 {
            anyhow::bail!("telemetry_queue_depth must be at least 1");
        }
        if self.lifecycle_interval_secs == 0 {
            anyhow::bail!("lifecycle_interval_secs must be at least 1");
        }
        let rules = &self.fault_rules;
        for (name, secs) in [
            ("over_current_sustain_secs", rules.over_current_sustain_secs),
            ("over_temp_sustain_secs", rules.over_temp_sustain_secs),
        ] {
            if secs > MAX_SUSTAIN_SECS {
                anyhow::bail!(
                    "fault_rules.{} must be at most {} (got {})",
                    name,
                    MAX_SUSTAIN_SECS,
                    secs
                );
            }
        }
        if !rules.over_temp_celsius.is_finite() {
            anyhow::bail!("fault_rules.over_temp_celsius must be finite");
        }
        if !rules.max_data_error_rate.is_finite() || rules.max_data_error_rate < 0.0 {
            anyhow::bail!("fault_rules.max_data_error_rate must be a finite non-negative rate");
        }
        Ok(())
    }
}
