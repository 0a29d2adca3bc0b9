//! Configuration loading from an optional JSON document plus environment overrides.
//!
//! # Design
//! - The document path comes from `SALVOR_RECOVERY_CONFIG`; a missing variable means defaults.
//! - Individual `SALVOR_*` variables override document values.
//! - Lookups are injected so tests never touch the process environment.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::model::SalvorConfig;

/// Environment variable naming the JSON configuration document.
pub const CONFIG_PATH_ENV: &str = "SALVOR_RECOVERY_CONFIG";

const ESCALATION_GRACE_ENV: &str = "SALVOR_ESCALATION_GRACE_MS";
const BACKOFF_BASE_ENV: &str = "SALVOR_BACKOFF_BASE_MS";
const BACKOFF_CAP_ENV: &str = "SALVOR_BACKOFF_CAP_MS";
const BACKGROUND_INTERVAL_ENV: &str = "SALVOR_BACKGROUND_INTERVAL_MS";
const AUTO_CREATE_ENV: &str = "SALVOR_AUTO_CREATE_DIRECTORIES";
const LOG_LEVEL_ENV: &str = "SALVOR_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "SALVOR_LOG_FORMAT";

/// Load configuration from the process environment.
///
/// # Errors
///
/// Returns an error when the document cannot be read or parsed, or when an
/// override carries an invalid value.
pub fn load_config() -> ConfigResult<SalvorConfig> {
    load_config_with(|name| std::env::var(name).ok())
}

/// Load configuration using the supplied variable lookup.
///
/// # Errors
///
/// Returns an error when the document cannot be read or parsed, or when an
/// override carries an invalid value.
pub fn load_config_with<F>(lookup: F) -> ConfigResult<SalvorConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match non_empty(lookup(CONFIG_PATH_ENV)) {
        Some(path) => read_document(Path::new(&path))?,
        None => {
            debug!("no configuration document set; using defaults");
            SalvorConfig::default()
        }
    };

    let recovery = &mut config.recovery;
    if let Some(value) = parse_millis(&lookup, ESCALATION_GRACE_ENV, "escalation_grace_ms")? {
        recovery.escalation_grace_ms = value;
    }
    if let Some(value) = parse_millis(&lookup, BACKOFF_BASE_ENV, "backoff_base_ms")? {
        recovery.backoff_base_ms = value;
    }
    if let Some(value) = parse_millis(&lookup, BACKOFF_CAP_ENV, "backoff_cap_ms")? {
        recovery.backoff_cap_ms = value;
    }
    if let Some(value) =
        parse_millis(&lookup, BACKGROUND_INTERVAL_ENV, "background_interval_ms")?
    {
        recovery.background_interval_ms = value;
    }
    if let Some(raw) = non_empty(lookup(AUTO_CREATE_ENV)) {
        recovery.auto_create_directories = match parse_flag(&raw) {
            Some(flag) => flag,
            None => {
                return Err(ConfigError::InvalidField {
                    section: "recovery".to_string(),
                    field: "auto_create_directories".to_string(),
                    value: Some(raw),
                    reason: "expected a boolean flag",
                });
            }
        };
    }

    if let Some(level) = non_empty(lookup(LOG_LEVEL_ENV)) {
        config.logging.level = level;
    }
    if let Some(format) = non_empty(lookup(LOG_FORMAT_ENV)) {
        config.logging.format = Some(format);
    }

    Ok(config)
}

fn read_document(path: &Path) -> ConfigResult<SalvorConfig> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        operation: "config.read",
        path: path.to_path_buf(),
        source,
    })?;
    let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "loaded recovery configuration document");
    Ok(config)
}

fn parse_millis<F>(lookup: &F, name: &str, field: &str) -> ConfigResult<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = non_empty(lookup(name)) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidField {
            section: "recovery".to_string(),
            field: field.to_string(),
            value: Some(raw),
            reason: "expected milliseconds as an unsigned integer",
        })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = load_config_with(|_| None).expect("defaults load");
        assert_eq!(config, SalvorConfig::default());
    }

    #[test]
    fn document_and_overrides_merge() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"{{"recovery": {{"backoff_base_ms": 2000, "auto_create_directories": false}},
                "logging": {{"level": "debug"}}}}"#
        )
        .expect("write");
        let path = file.path().display().to_string();

        let config = load_config_with(lookup_from(&[
            (CONFIG_PATH_ENV, path.as_str()),
            (BACKOFF_CAP_ENV, "90000"),
            (AUTO_CREATE_ENV, "YES"),
            (LOG_FORMAT_ENV, "json"),
        ]))
        .expect("config loads");

        assert_eq!(config.recovery.backoff_base_ms, 2_000);
        assert_eq!(config.recovery.backoff_cap_ms, 90_000);
        assert!(config.recovery.auto_create_directories);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format.as_deref(), Some("json"));
    }

    #[test]
    fn invalid_override_reports_field() {
        let err = load_config_with(lookup_from(&[(ESCALATION_GRACE_ENV, "soon")]))
            .expect_err("invalid millis");
        match err {
            ConfigError::InvalidField { field, value, .. } => {
                assert_eq!(field, "escalation_grace_ms");
                assert_eq!(value.as_deref(), Some("soon"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = load_config_with(lookup_from(&[(AUTO_CREATE_ENV, "maybe")]))
            .expect_err("invalid flag");
        assert!(matches!(err, ConfigError::InvalidField { .. }));
    }

    #[test]
    fn missing_and_malformed_documents_error() {
        let err = load_config_with(lookup_from(&[(CONFIG_PATH_ENV, "/nonexistent/salvor.json")]))
            .expect_err("missing file");
        assert!(matches!(err, ConfigError::Io { operation: "config.read", .. }));

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "{{ not json").expect("write");
        let path = file.path().display().to_string();
        let err = load_config_with(lookup_from(&[(CONFIG_PATH_ENV, path.as_str())]))
            .expect_err("malformed");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
