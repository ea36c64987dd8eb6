use crate::db;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SETTINGS_KEY: &str = "engine.config";

/// Tunables for ingestion, defaulter checks and the allocation sync.
/// Stored as a JSON blob in `settings`; missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub defaulter_threshold: f64,
    pub sync_interval_secs: u64,
    pub bulk_offload_threshold: usize,
    pub max_reported_errors: usize,
    pub header_scan_rows: usize,
    pub window_radius: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            defaulter_threshold: 75.0,
            sync_interval_secs: 300,
            bulk_offload_threshold: 10,
            max_reported_errors: 10,
            header_scan_rows: 10,
            window_radius: 6,
        }
    }
}

impl EngineConfig {
    pub fn load(conn: &Connection) -> anyhow::Result<Self> {
        match db::settings_get_json(conn, SETTINGS_KEY)? {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, conn: &Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, SETTINGS_KEY, &serde_json::to_value(self)?)
    }

    pub fn apply_patch(&mut self, patch: &Value) -> Result<(), String> {
        let Some(obj) = patch.as_object() else {
            return Err("patch must be an object".to_string());
        };
        for (key, v) in obj {
            match key.as_str() {
                "defaulterThreshold" => {
                    let t = v
                        .as_f64()
                        .ok_or_else(|| format!("{} must be a number", key))?;
                    if !(0.0..=100.0).contains(&t) {
                        return Err(format!("{} must be between 0 and 100", key));
                    }
                    self.defaulter_threshold = t;
                }
                "syncIntervalSecs" => {
                    self.sync_interval_secs = parse_u64_range(obj, key, 5, 86_400)?;
                }
                "bulkOffloadThreshold" => {
                    self.bulk_offload_threshold = parse_u64_range(obj, key, 1, 10_000)? as usize;
                }
                "maxReportedErrors" => {
                    self.max_reported_errors = parse_u64_range(obj, key, 0, 1_000)? as usize;
                }
                "headerScanRows" => {
                    self.header_scan_rows = parse_u64_range(obj, key, 1, 100)? as usize;
                }
                "windowRadius" => {
                    self.window_radius = parse_u64_range(obj, key, 1, 50)? as usize;
                }
                other => return Err(format!("unknown config key: {}", other)),
            }
        }
        Ok(())
    }
}

fn parse_u64_range(obj: &Map<String, Value>, key: &str, min: u64, max: u64) -> Result<u64, String> {
    let n = obj
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| format!("{} must be a non-negative integer", key))?;
    if n < min || n > max {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(n)
}
