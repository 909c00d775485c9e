//! Per-target metadata resolution.
//!
//! Every inbound request carries an opaque string map configured on the
//! scaled object. [`resolve`] turns that map into a typed record,
//! applying defaults and validating each recognized field explicitly —
//! a malformed value is a resolution error, never a silent coercion.
//! Unrecognized keys are ignored; the orchestrator passes
//! provider-specific keys through untouched.

use std::collections::HashMap;

use redscale_redis::ConnectOptions;
use thiserror::Error;

use crate::proto::ScaledObjectRef;

/// Result type alias for metadata resolution.
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Errors produced while resolving a target's metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("script is required")]
    MissingScript,

    #[error("invalid value {value:?} for {field}")]
    InvalidField { field: &'static str, value: String },
}

/// Typed view of one target's configuration.
///
/// Resolved fresh on every request and discarded when the request
/// completes; never cached or mutated.
#[derive(Debug, Clone)]
pub struct ScalerMetadata {
    /// `namespace/name` of the scaled object.
    pub full_name: String,
    pub address: Option<String>,
    pub host: Option<String>,
    pub port: String,
    pub enable_tls: bool,
    pub unsafe_ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
    /// Lua script producing the metric value. Mandatory.
    pub script: String,
    /// Serialized YAML list of keys passed to the script.
    pub keys: String,
    /// Serialized YAML list of arguments passed to the script.
    pub args: String,
    pub metric_name: String,
    pub activation_value: i64,
    pub target_value: i64,
}

impl ScalerMetadata {
    /// Connection cache key: one connection per target + metric pair.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.full_name, self.metric_name)
    }

    /// Connection options for the connection manager.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            address: self.address.clone(),
            host: self.host.clone(),
            port: self.port.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database,
            enable_tls: self.enable_tls,
            unsafe_ssl: self.unsafe_ssl,
        }
    }
}

/// Resolve the scaled object's metadata map into a typed record.
pub fn resolve(scaled_object: &ScaledObjectRef) -> MetadataResult<ScalerMetadata> {
    let raw = &scaled_object.scaler_metadata;
    let full_name = format!("{}/{}", scaled_object.namespace, scaled_object.name);

    let script = match raw.get("script") {
        Some(script) if !script.is_empty() => script.clone(),
        _ => return Err(MetadataError::MissingScript),
    };

    let metric_name = match get_non_empty(raw, "metricName") {
        Some(name) => name,
        None => format!("redis-{full_name}").replace('/', "-"),
    };

    // A configured target of 0 falls back to the default as well.
    let mut target_value = parse_int(raw, "targetValue")?.unwrap_or(5);
    if target_value == 0 {
        target_value = 5;
    }

    Ok(ScalerMetadata {
        address: get_non_empty(raw, "address"),
        host: get_non_empty(raw, "host"),
        port: raw.get("port").cloned().unwrap_or_else(|| "6379".to_string()),
        enable_tls: parse_bool(raw, "enableTLS")?,
        unsafe_ssl: parse_bool(raw, "unsafeSSL")?,
        username: get_non_empty(raw, "username"),
        password: get_non_empty(raw, "password"),
        database: parse_int(raw, "database")?.unwrap_or(0),
        script,
        keys: raw.get("keys").cloned().unwrap_or_default(),
        args: raw.get("args").cloned().unwrap_or_default(),
        metric_name,
        activation_value: parse_int(raw, "activationValue")?.unwrap_or(0),
        target_value,
        full_name,
    })
}

fn get_non_empty(raw: &HashMap<String, String>, field: &str) -> Option<String> {
    raw.get(field).filter(|value| !value.is_empty()).cloned()
}

fn parse_bool(raw: &HashMap<String, String>, field: &'static str) -> MetadataResult<bool> {
    match raw.get(field) {
        None => Ok(false),
        Some(value) => value.parse().map_err(|_| MetadataError::InvalidField {
            field,
            value: value.clone(),
        }),
    }
}

fn parse_int(raw: &HashMap<String, String>, field: &'static str) -> MetadataResult<Option<i64>> {
    match raw.get(field) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| MetadataError::InvalidField {
                field,
                value: value.clone(),
            }),
    }
}
