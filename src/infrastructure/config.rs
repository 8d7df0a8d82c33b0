use crate::domain::models::OperatingHours;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

const APP_JSON: &str = "app.json";
const REMOTE_JSON: &str = "remote.json";
const DEFAULT_OWNER_ID: &str = "default";
const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api/";
const DEFAULT_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_RESYNC_INTERVAL_SECONDS: u64 = 60;

pub const ENV_OWNER_ID: &str = "VENUE_OWNER_ID";
pub const ENV_REMOTE_BASE_URL: &str = "VENUE_REMOTE_BASE_URL";
pub const ENV_REMOTE_TIMEOUT_SECONDS: &str = "VENUE_REMOTE_TIMEOUT_SECONDS";

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub remote: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSettings {
    pub base_url: Url,
    pub timeout: Duration,
    pub resync_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenueConfig {
    pub owner_id: String,
    pub time_zone: Tz,
    pub operating_hours: OperatingHours,
    pub remote: RemoteSettings,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "ownerId": DEFAULT_OWNER_ID,
                "timezone": "UTC",
                "operatingHours": {
                    "start": 8,
                    "end": 23
                }
            }),
        ),
        (
            REMOTE_JSON,
            serde_json::json!({
                "schema": 1,
                "baseUrl": DEFAULT_BASE_URL,
                "timeoutSeconds": DEFAULT_TIMEOUT_SECONDS,
                "resyncIntervalSeconds": DEFAULT_RESYNC_INTERVAL_SECONDS
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        remote: read_config(&config_dir.join(REMOTE_JSON))?,
    })
}

/// Reads the config files, then lets `lookup` (normally the process
/// environment) override owner id, base URL and timeout.
pub fn load_venue_config_with_lookup<F>(config_dir: &Path, lookup: F) -> Result<VenueConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let bundle = load_configs(config_dir)?;

    let owner_id = optional_lookup_value(&lookup, ENV_OWNER_ID)
        .or_else(|| string_field(&bundle.app, "ownerId"))
        .unwrap_or_else(|| DEFAULT_OWNER_ID.to_string());

    let time_zone = match string_field(&bundle.app, "timezone") {
        Some(raw) => raw
            .parse::<Tz>()
            .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{raw}': {error}")))?,
        None => Tz::UTC,
    };

    let operating_hours = read_operating_hours(&bundle.app)?;

    let raw_base_url = optional_lookup_value(&lookup, ENV_REMOTE_BASE_URL)
        .or_else(|| string_field(&bundle.remote, "baseUrl"))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let base_url = parse_base_url(&raw_base_url)?;

    let timeout_seconds = match optional_lookup_value(&lookup, ENV_REMOTE_TIMEOUT_SECONDS) {
        Some(raw) => raw.parse::<u64>().map_err(|error| {
            InfraError::InvalidConfig(format!(
                "{ENV_REMOTE_TIMEOUT_SECONDS} must be a positive integer: {error}"
            ))
        })?,
        None => bundle
            .remote
            .get("timeoutSeconds")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
    };
    if timeout_seconds == 0 {
        return Err(InfraError::InvalidConfig(
            "remote timeout must be > 0 seconds".to_string(),
        ));
    }
    let resync_seconds = bundle
        .remote
        .get("resyncIntervalSeconds")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(DEFAULT_RESYNC_INTERVAL_SECONDS)
        .max(1);

    Ok(VenueConfig {
        owner_id,
        time_zone,
        operating_hours,
        remote: RemoteSettings {
            base_url,
            timeout: Duration::from_secs(timeout_seconds),
            resync_interval: Duration::from_secs(resync_seconds),
        },
    })
}

fn read_operating_hours(app: &serde_json::Value) -> Result<OperatingHours, InfraError> {
    let defaults = OperatingHours::default();
    let Some(raw) = app.get("operatingHours") else {
        return Ok(defaults);
    };
    let hour_field = |name: &str, fallback: u8| -> Result<u8, InfraError> {
        match raw.get(name).and_then(serde_json::Value::as_u64) {
            Some(value) => u8::try_from(value).map_err(|_| {
                InfraError::InvalidConfig(format!("operatingHours.{name} out of range: {value}"))
            }),
            None => Ok(fallback),
        }
    };
    let hours = OperatingHours {
        start_hour: hour_field("start", defaults.start_hour)?,
        end_hour: hour_field("end", defaults.end_hour)?,
    };
    hours
        .validate()
        .map_err(|error| InfraError::InvalidConfig(error.to_string()))?;
    Ok(hours)
}

fn parse_base_url(raw: &str) -> Result<Url, InfraError> {
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = Url::parse(&normalized)
        .map_err(|error| InfraError::InvalidConfig(format!("invalid remote base url '{raw}': {error}")))?;
    if url.cannot_be_a_base() {
        return Err(InfraError::InvalidConfig(format!(
            "remote base url '{raw}' cannot be a base"
        )));
    }
    Ok(url)
}

fn string_field(value: &serde_json::Value, name: &str) -> Option<String> {
    value
        .get(name)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn optional_lookup_value<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
