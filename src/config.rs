// log-enricher - config.rs
//
// Environment-variable configuration loading. Read once at process
// start into a typed `Config`; any invalid value is a fatal `ConfigError`.

use std::collections::HashMap;
use std::path::PathBuf;

use regex::Regex;

use crate::util::constants::{
    DEFAULT_ENRICHED_FILE_SUFFIX, DEFAULT_HTTP_ADDR, DEFAULT_HTTP_MAX_BODY_BYTES,
    DEFAULT_HTTP_SOURCE_ROOT, DEFAULT_LOG_FILE_EXTENSIONS, DEFAULT_STATE_FILE_PATH,
};
use crate::util::error::ConfigError;

/// Sink backend selection (`BACKEND`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    File,
    Loki,
}

/// App-naming policy resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppNamingPolicy {
    pub static_app: Option<String>,
    pub identification_regex: Option<Regex>,
}

/// A single configured pipeline stage item, parsed from the
/// `STAGE_<N>_*` environment family.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub index: usize,
    pub stage_type: String,
    pub applies_to: Option<Regex>,
    pub params: HashMap<String, String>,
}

/// Fully parsed, validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub state_file_path: PathBuf,
    pub log_base_path: PathBuf,
    pub log_file_extensions: Vec<String>,
    pub log_files_ignored: Option<Regex>,
    pub app_naming: AppNamingPolicy,
    pub backend: Backend,
    pub loki_url: Option<String>,
    pub enriched_file_suffix: String,
    pub http_enabled: bool,
    pub http_addr: String,
    pub http_max_body_bytes: usize,
    pub http_bearer_token: Option<String>,
    pub http_source_root: PathBuf,
    pub log_level: Option<String>,
    pub stages: Vec<StageConfig>,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn compile_regex(field: &'static str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
        field,
        pattern: pattern.to_string(),
        source,
    })
}

impl Config {
    /// Load and validate configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let state_file_path = env_var("STATE_FILE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE_PATH));

        let log_base_path = env_var("LOG_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let log_file_extensions = match env_var("LOG_FILE_EXTENSIONS") {
            Some(v) => v
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_LOG_FILE_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let log_files_ignored = match env_var("LOG_FILES_IGNORED") {
            Some(pattern) => Some(compile_regex("LOG_FILES_IGNORED", &pattern)?),
            None => None,
        };

        let identification_regex = match env_var("APP_IDENTIFICATION_REGEX") {
            Some(pattern) => {
                let re = compile_regex("APP_IDENTIFICATION_REGEX", &pattern)?;
                if re.capture_names().flatten().all(|n| n != "app") {
                    return Err(ConfigError::MissingCaptureGroup {
                        field: "APP_IDENTIFICATION_REGEX",
                        group: "app",
                    });
                }
                Some(re)
            }
            None => None,
        };
        let app_naming = AppNamingPolicy {
            static_app: env_var("APP_NAME"),
            identification_regex,
        };

        let backend = match env_var("BACKEND").as_deref() {
            Some("file") | None => Backend::File,
            Some("loki") => Backend::Loki,
            Some(other) => {
                return Err(ConfigError::UnknownBackend {
                    value: other.to_string(),
                })
            }
        };

        let loki_url = env_var("LOKI_URL");
        if backend == Backend::Loki && loki_url.is_none() {
            return Err(ConfigError::MissingLokiUrl);
        }

        let enriched_file_suffix =
            env_var("ENRICHED_FILE_SUFFIX").unwrap_or_else(|| DEFAULT_ENRICHED_FILE_SUFFIX.to_string());

        let http_enabled = matches!(
            env_var("PROMTAIL_HTTP_ENABLED").as_deref(),
            Some("true") | Some("1") | Some("yes")
        );

        let http_addr = env_var("PROMTAIL_HTTP_ADDR").unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());

        let http_max_body_bytes = match env_var("PROMTAIL_HTTP_MAX_BODY_BYTES") {
            Some(v) => v.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                key: "PROMTAIL_HTTP_MAX_BODY_BYTES",
                value: v.clone(),
                expected: "a non-negative integer byte count",
            })?,
            None => DEFAULT_HTTP_MAX_BODY_BYTES,
        };

        let http_bearer_token = env_var("PROMTAIL_HTTP_BEARER_TOKEN");

        let http_source_root = env_var("PROMTAIL_HTTP_SOURCE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HTTP_SOURCE_ROOT));

        let log_level = env_var("LOG_LEVEL");

        let stages = Self::load_stages()?;

        Ok(Config {
            state_file_path,
            log_base_path,
            log_file_extensions,
            log_files_ignored,
            app_naming,
            backend,
            loki_url,
            enriched_file_suffix,
            http_enabled,
            http_addr,
            http_max_body_bytes,
            http_bearer_token,
            http_source_root,
            log_level,
            stages,
        })
    }

    /// Enumerate `STAGE_<N>_TYPE` / `STAGE_<N>_APPLIES_TO` /
    /// `STAGE_<N>_<PARAM>` contiguously from `N = 0`; the first missing
    /// `STAGE_<N>_TYPE` stops enumeration.
    fn load_stages() -> Result<Vec<StageConfig>, ConfigError> {
        let mut stages = Vec::new();
        let mut index = 0usize;

        loop {
            let type_key = format!("STAGE_{index}_TYPE");
            let Some(stage_type) = env_var(&type_key) else {
                break;
            };

            let applies_to = match env_var(&format!("STAGE_{index}_APPLIES_TO")) {
                Some(pattern) => {
                    if pattern.trim().is_empty() {
                        return Err(ConfigError::InvalidAppliesTo {
                            index,
                            reason: "pattern is empty".to_string(),
                        });
                    }
                    let re = Regex::new(&pattern).map_err(|source| ConfigError::InvalidRegex {
                        field: "applies_to",
                        pattern: pattern.clone(),
                        source,
                    })?;
                    Some(re)
                }
                None => None,
            };

            let prefix = format!("STAGE_{index}_");
            let mut params = HashMap::new();
            for (key, value) in std::env::vars() {
                let Some(param_name) = key.strip_prefix(&prefix) else {
                    continue;
                };
                let param_name = param_name.to_lowercase();
                if param_name == "type" || param_name == "applies_to" {
                    continue;
                }
                params.insert(param_name, value);
            }

            stages.push(StageConfig {
                index,
                stage_type,
                applies_to,
                params,
            });
            index += 1;
        }

        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialise tests that touch
    // them to avoid cross-test interference.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_log_enricher_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("STAGE_")
                || matches!(
                    key.as_str(),
                    "STATE_FILE_PATH"
                        | "LOG_BASE_PATH"
                        | "LOG_FILE_EXTENSIONS"
                        | "LOG_FILES_IGNORED"
                        | "APP_NAME"
                        | "APP_IDENTIFICATION_REGEX"
                        | "BACKEND"
                        | "LOKI_URL"
                        | "ENRICHED_FILE_SUFFIX"
                        | "PROMTAIL_HTTP_ENABLED"
                        | "PROMTAIL_HTTP_ADDR"
                        | "PROMTAIL_HTTP_MAX_BODY_BYTES"
                        | "PROMTAIL_HTTP_BEARER_TOKEN"
                        | "PROMTAIL_HTTP_SOURCE_ROOT"
                        | "LOG_LEVEL"
                )
            {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_log_enricher_env();
        let cfg = Config::from_env().expect("default config should load");
        assert_eq!(cfg.backend, Backend::File);
        assert_eq!(cfg.http_max_body_bytes, DEFAULT_HTTP_MAX_BODY_BYTES);
        assert_eq!(cfg.log_file_extensions, vec!["log".to_string()]);
        assert!(cfg.stages.is_empty());
    }

    #[test]
    fn loki_backend_requires_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_log_enricher_env();
        std::env::set_var("BACKEND", "loki");
        let result = Config::from_env();
        std::env::remove_var("BACKEND");
        assert!(matches!(result, Err(ConfigError::MissingLokiUrl)));
    }

    #[test]
    fn stage_enumeration_stops_at_first_gap() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_log_enricher_env();
        std::env::set_var("STAGE_0_TYPE", "filter");
        std::env::set_var("STAGE_0_ACTION", "drop");
        std::env::set_var("STAGE_2_TYPE", "geoip_enrichment");
        let cfg = Config::from_env().expect("config should load");
        std::env::remove_var("STAGE_0_TYPE");
        std::env::remove_var("STAGE_0_ACTION");
        std::env::remove_var("STAGE_2_TYPE");

        assert_eq!(cfg.stages.len(), 1);
        assert_eq!(cfg.stages[0].stage_type, "filter");
        assert_eq!(cfg.stages[0].params.get("action").map(String::as_str), Some("drop"));
    }

    #[test]
    fn identification_regex_requires_app_group() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_log_enricher_env();
        std::env::set_var("APP_IDENTIFICATION_REGEX", r"(?P<nope>\w+)");
        let result = Config::from_env();
        std::env::remove_var("APP_IDENTIFICATION_REGEX");
        assert!(matches!(
            result,
            Err(ConfigError::MissingCaptureGroup { group: "app", .. })
        ));
    }
}
