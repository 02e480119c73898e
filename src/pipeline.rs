// log-enricher - pipeline.rs
//
// 4.G Stage pipeline: ordered stages with optional per-source regex
// scoping; routes entries through parsers, extractors, the filter, and the
// enrichment stages built in the other modules.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use tokio_util::sync::CancellationToken;

use crate::cache::{CacheHousekeeping, PersistedCache};
use crate::config::StageConfig;
use crate::extract::{ClientIpExtractor, TemplateResolver, TemplatedEnrichment, TemplatePart, TimestampExtractor};
use crate::filter::{FilterAction, FilterRule, FilterStage, MatchMode};
use crate::geoip::GeoIpStage;
use crate::hostname::HostnameStage;
use crate::model::LogEntry;
use crate::parsers::{JsonParser, StructuredParser, DEFAULT_STRUCTURED_PATTERN};
use crate::state::StateStore;
use crate::util::error::ConfigError;

/// A unit in the pipeline (Glossary: "Stage"). `process` returns whether the
/// entry should continue through the rest of the sub-pipeline.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Returns `keep`. Errors are logged by the caller and treated as
    /// "keep" unless the stage itself returns `keep=false`.
    async fn process(&self, entry: &mut LogEntry) -> bool;
}

struct NamedStage {
    applies_to: Option<Regex>,
    stage: Box<dyn Stage>,
}

/// Constructs per-path sub-pipelines from configuration.
pub struct PipelineManager {
    stages: Vec<NamedStage>,
    caches: Vec<Arc<dyn CacheHousekeeping>>,
    geoip_stages: Vec<Arc<GeoIpStage>>,
    hostname_stages: Vec<Arc<HostnameStage>>,
}

macro_rules! sync_stage {
    ($name:literal, $body:expr) => {{
        struct Wrapped<F>(F);
        #[async_trait::async_trait]
        impl<F> Stage for Wrapped<F>
        where
            F: Fn(&mut LogEntry) -> bool + Send + Sync,
        {
            fn name(&self) -> &str {
                $name
            }
            async fn process(&self, entry: &mut LogEntry) -> bool {
                (self.0)(entry)
            }
        }
        Box::new(Wrapped($body)) as Box<dyn Stage>
    }};
}

impl PipelineManager {
    /// Build every configured stage item, in order, failing fast on the
    /// first invalid one. Configuration errors are always fatal at startup.
    pub fn from_config(items: &[StageConfig], store: &StateStore) -> Result<Self, ConfigError> {
        let mut stages = Vec::with_capacity(items.len());
        let mut registry = StageRegistry::default();
        for item in items {
            let stage = build_stage(item, store, &mut registry)?;
            stages.push(NamedStage {
                applies_to: item.applies_to.clone(),
                stage,
            });
        }
        Ok(PipelineManager {
            stages,
            caches: registry.caches,
            geoip_stages: registry.geoip_stages,
            hostname_stages: registry.hostname_stages,
        })
    }

    /// Spawn every background task this pipeline's constructed stages need
    /// for the life of the process: jittered cache housekeeping for every
    /// cache a stage created, the GeoIP reload watcher for every
    /// `geoip_enrichment` stage, and for every `hostname_enrichment` stage
    /// both its neighbour-table populate task and its hostname-cache
    /// refresher.
    pub fn spawn_background_tasks(
        &self,
        store: Arc<StateStore>,
        token: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for cache in &self.caches {
            handles.push(Arc::clone(cache).spawn_housekeeping(Arc::clone(&store), token.clone()));
        }
        for stage in &self.geoip_stages {
            match stage.spawn_reload_watcher(token.clone()) {
                Ok(handle) => handles.push(handle),
                Err(err) => tracing::warn!(error = %err, "failed to start geoip reload watcher"),
            }
        }
        for stage in &self.hostname_stages {
            handles.push(stage.spawn_neighbour_populate(token.clone()));
            handles.push(stage.spawn_refresher(token.clone()));
        }
        handles
    }

    /// Returns the sub-pipeline for `source_path`: stages without
    /// `applies_to` are always present, stages with one are present iff it
    /// matches, order preserved.
    pub fn sub_pipeline_for(&self, source_path: &str) -> Vec<&dyn Stage> {
        self.stages
            .iter()
            .filter(|s| s.applies_to.as_ref().map(|re| re.is_match(source_path)).unwrap_or(true))
            .map(|s| s.stage.as_ref())
            .collect()
    }

    /// Run the sub-pipeline for this entry's source path. Returns whether
    /// the entry should be sent to the sink.
    pub async fn run(&self, entry: &mut LogEntry) -> bool {
        let sub = self.sub_pipeline_for(&entry.source_path);
        for stage in sub {
            if !stage.process(entry).await {
                tracing::trace!(stage = stage.name(), source_path = %entry.source_path, "stage dropped entry");
                return false;
            }
        }
        true
    }
}

/// Accumulates the background-task handles a pipeline's stages create as
/// they're built, so the application wiring can spawn housekeeping/reload
/// tasks for them after construction without reaching back into each
/// stage's private state.
#[derive(Default)]
struct StageRegistry {
    caches: Vec<Arc<dyn CacheHousekeeping>>,
    geoip_stages: Vec<Arc<GeoIpStage>>,
    hostname_stages: Vec<Arc<HostnameStage>>,
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str)
}

fn param_list(params: &HashMap<String, String>, key: &str) -> Vec<String> {
    param(params, key)
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn build_stage(
    item: &StageConfig,
    store: &StateStore,
    registry: &mut StageRegistry,
) -> Result<Box<dyn Stage>, ConfigError> {
    match item.stage_type.as_str() {
        "json_parser" => {
            let cache: Arc<PersistedCache<bool>> =
                PersistedCache::new(format!("json_parser_{}", item.index), true, store);
            registry.caches.push(Arc::clone(&cache) as Arc<dyn CacheHousekeeping>);
            let parser = JsonParser::new(cache);
            Ok(sync_stage!("json_parser", move |e: &mut LogEntry| {
                parser.process(e);
                true
            }))
        }
        "structured_parser" => {
            let pattern = param(&item.params, "pattern").unwrap_or(DEFAULT_STRUCTURED_PATTERN);
            let cache: Arc<PersistedCache<bool>> =
                PersistedCache::new(format!("structured_parser_{}", item.index), true, store);
            registry.caches.push(Arc::clone(&cache) as Arc<dyn CacheHousekeeping>);
            let parser =
                StructuredParser::new(pattern, cache).map_err(|e| ConfigError::InvalidAppliesTo {
                    index: item.index,
                    reason: e.to_string(),
                })?;
            Ok(sync_stage!("structured_parser", move |e: &mut LogEntry| {
                parser.process(e);
                true
            }))
        }
        "filter" => {
            let mut rules = Vec::new();
            if let Some(pattern) = param(&item.params, "regex") {
                rules.push(FilterRule::Regex(Regex::new(pattern).map_err(|source| {
                    ConfigError::InvalidRegex {
                        field: "filter.regex",
                        pattern: pattern.to_string(),
                        source,
                    }
                })?));
            }
            if let Some(v) = param(&item.params, "min_size").and_then(|v| v.parse().ok()) {
                rules.push(FilterRule::MinSize(v));
            }
            if let Some(v) = param(&item.params, "max_size").and_then(|v| v.parse().ok()) {
                rules.push(FilterRule::MaxSize(v));
            }
            if let Some(v) = param(&item.params, "max_age_secs").and_then(|v| v.parse::<i64>().ok()) {
                rules.push(FilterRule::MaxAge(chrono::Duration::seconds(v)));
            }
            if let (Some(field), Some(pattern)) =
                (param(&item.params, "field"), param(&item.params, "field_regex"))
            {
                rules.push(FilterRule::FieldRegex {
                    field: field.to_string(),
                    pattern: Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                        field: "filter.field_regex",
                        pattern: pattern.to_string(),
                        source,
                    })?,
                });
            }
            let mode = match param(&item.params, "match") {
                Some("all") => MatchMode::All,
                _ => MatchMode::Any,
            };
            let action = match param(&item.params, "action") {
                Some("keep") => FilterAction::Keep,
                _ => FilterAction::Drop,
            };
            let filter = FilterStage::new(rules, mode, action);
            Ok(sync_stage!("filter", move |e: &mut LogEntry| filter.process(e)))
        }
        "client_ip_extraction" => {
            let candidates = param_list(&item.params, "fields");
            if candidates.is_empty() {
                return Err(ConfigError::InvalidAppliesTo {
                    index: item.index,
                    reason: "client_ip_extraction requires a non-empty 'fields' list".to_string(),
                });
            }
            let target = param(&item.params, "target").map(str::to_string);
            let cache = PersistedCache::new(format!("client_ip_{}", item.index), true, store);
            registry.caches.push(Arc::clone(&cache) as Arc<dyn CacheHousekeeping>);
            let extractor = ClientIpExtractor::new(candidates, target, cache);
            Ok(sync_stage!("client_ip_extraction", move |e: &mut LogEntry| {
                extractor.process(e);
                true
            }))
        }
        "timestamp_extraction" => {
            let extra_fields = param_list(&item.params, "fields");
            let cache = PersistedCache::new(format!("timestamp_{}", item.index), true, store);
            registry.caches.push(Arc::clone(&cache) as Arc<dyn CacheHousekeeping>);
            let extractor = TimestampExtractor::new(extra_fields, cache);
            Ok(sync_stage!("timestamp_extraction", move |e: &mut LogEntry| {
                extractor.process(e);
                true
            }))
        }
        "template_resolver" => {
            let template_field = param(&item.params, "template_field")
                .unwrap_or("template")
                .to_string();
            let variables_prefix = param(&item.params, "variables_prefix").map(str::to_string);
            let output_field = param(&item.params, "output_field").unwrap_or("rendered").to_string();
            let cache: Arc<PersistedCache<Vec<TemplatePart>>> =
                PersistedCache::new(format!("template_{}", item.index), false, store);
            registry.caches.push(Arc::clone(&cache) as Arc<dyn CacheHousekeeping>);
            let resolver = TemplateResolver::new(template_field, variables_prefix, output_field, cache);
            Ok(async_stage(move |e: &mut LogEntry| {
                if let Err(err) = resolver.process(e) {
                    tracing::warn!(error = %err, "template_resolver stage failed");
                }
                true
            }))
        }
        "templated_enrichment" => {
            let template = param(&item.params, "template").unwrap_or("").to_string();
            let output_field = param(&item.params, "output_field").unwrap_or("rendered").to_string();
            let enrichment = TemplatedEnrichment::new(&template, output_field);
            Ok(async_stage(move |e: &mut LogEntry| {
                if let Err(err) = enrichment.process(e) {
                    tracing::warn!(error = %err, "templated_enrichment stage failed");
                }
                true
            }))
        }
        "hostname_enrichment" => {
            use crate::hostname::{HostnameStage, ProtocolConfig};
            let protocols = ProtocolConfig {
                rdns: param(&item.params, "rdns").map(|v| v == "true").unwrap_or(true),
                mdns: param(&item.params, "mdns").map(|v| v == "true").unwrap_or(false),
                llmnr: param(&item.params, "llmnr").map(|v| v == "true").unwrap_or(false),
                netbios: param(&item.params, "netbios").map(|v| v == "true").unwrap_or(false),
            };
            let ip_to_mac = PersistedCache::new(format!("ip_to_mac_{}", item.index), true, store);
            let mac_to_hostname = PersistedCache::new(format!("mac_to_hostname_{}", item.index), true, store);
            registry.caches.push(Arc::clone(&ip_to_mac) as Arc<dyn CacheHousekeeping>);
            registry.caches.push(Arc::clone(&mac_to_hostname) as Arc<dyn CacheHousekeeping>);
            let resolver_addr = param(&item.params, "resolver").map(str::to_string);
            let neighbours = default_neighbour_watcher();
            let stage: Arc<HostnameStage> = Arc::new(HostnameStage::new(
                ip_to_mac,
                mac_to_hostname,
                neighbours,
                protocols,
                resolver_addr,
            ));
            registry.hostname_stages.push(Arc::clone(&stage));
            Ok(Box::new(HostnameStageAdapter(stage)))
        }
        "geoip_enrichment" => {
            let db_path = param(&item.params, "database").ok_or_else(|| ConfigError::InvalidAppliesTo {
                index: item.index,
                reason: "geoip_enrichment requires a 'database' path parameter".to_string(),
            })?;
            let cache = PersistedCache::new(format!("geoip_{}", item.index), true, store);
            registry.caches.push(Arc::clone(&cache) as Arc<dyn CacheHousekeeping>);
            let stage = GeoIpStage::open(db_path.into(), cache).map_err(|e| ConfigError::InvalidAppliesTo {
                index: item.index,
                reason: e.to_string(),
            })?;
            registry.geoip_stages.push(Arc::clone(&stage));
            Ok(Box::new(GeoIpStageAdapter(stage)))
        }
        other => Err(ConfigError::UnknownStageType {
            index: item.index,
            value: other.to_string(),
        }),
    }
}

/// Select the platform neighbour-table watcher implementation at build
/// time.
#[cfg(target_os = "linux")]
fn default_neighbour_watcher() -> Arc<dyn crate::hostname::NeighbourWatcher> {
    crate::hostname::LinuxNeighbourWatcher::new()
}

#[cfg(not(target_os = "linux"))]
fn default_neighbour_watcher() -> Arc<dyn crate::hostname::NeighbourWatcher> {
    Arc::new(crate::hostname::NoopNeighbourWatcher)
}

/// Wraps a synchronous `Fn(&mut LogEntry) -> bool` closure as an async
/// `Stage`, for stages whose logic doesn't itself need to `.await`.
fn async_stage(f: impl Fn(&mut LogEntry) -> bool + Send + Sync + 'static) -> Box<dyn Stage> {
    sync_stage!("async_wrapped", f)
}

struct HostnameStageAdapter(Arc<HostnameStage>);

#[async_trait::async_trait]
impl Stage for HostnameStageAdapter {
    fn name(&self) -> &str {
        "hostname_enrichment"
    }
    async fn process(&self, entry: &mut LogEntry) -> bool {
        self.0.process(entry).await;
        true
    }
}

struct GeoIpStageAdapter(Arc<GeoIpStage>);

#[async_trait::async_trait]
impl Stage for GeoIpStageAdapter {
    fn name(&self) -> &str {
        "geoip_enrichment"
    }
    async fn process(&self, entry: &mut LogEntry) -> bool {
        self.0.process(entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_store() -> StateStore {
        let dir = TempDir::new().unwrap();
        StateStore::load(&dir.path().join("state.json")).unwrap()
    }

    #[tokio::test]
    async fn empty_stage_list_is_identity() {
        let store = fresh_store();
        let manager = PipelineManager::from_config(&[], &store).unwrap();
        let mut entry = LogEntry::new_empty();
        entry.line = "hello".to_string();
        let keep = manager.run(&mut entry).await;
        assert!(keep);
        assert!(entry.fields.is_empty());
        assert_eq!(entry.line, "hello");
    }

    #[tokio::test]
    async fn unknown_stage_type_is_rejected_at_construction() {
        let store = fresh_store();
        let item = StageConfig {
            index: 0,
            stage_type: "not_a_real_stage".to_string(),
            applies_to: None,
            params: HashMap::new(),
        };
        let result = PipelineManager::from_config(&[item], &store);
        assert!(matches!(result, Err(ConfigError::UnknownStageType { .. })));
    }

    #[tokio::test]
    async fn applies_to_scopes_stage_to_matching_paths() {
        let store = fresh_store();
        let mut params = HashMap::new();
        params.insert("regex".to_string(), "drop-me".to_string());
        params.insert("action".to_string(), "drop".to_string());
        let item = StageConfig {
            index: 0,
            stage_type: "filter".to_string(),
            applies_to: Some(Regex::new(r"\.special\.log$").unwrap()),
            params,
        };
        let manager = PipelineManager::from_config(&[item], &store).unwrap();

        let mut scoped = LogEntry::new_empty();
        scoped.source_path = "/var/log/app.special.log".to_string();
        scoped.line = "drop-me now".to_string();
        assert!(!manager.run(&mut scoped).await);

        let mut unscoped = LogEntry::new_empty();
        unscoped.source_path = "/var/log/app.log".to_string();
        unscoped.line = "drop-me now".to_string();
        assert!(manager.run(&mut unscoped).await);
    }

    #[tokio::test]
    async fn json_parser_stage_keeps_entry_on_invalid_json() {
        let store = fresh_store();
        let item = StageConfig {
            index: 0,
            stage_type: "json_parser".to_string(),
            applies_to: None,
            params: HashMap::new(),
        };
        let manager = PipelineManager::from_config(&[item], &store).unwrap();

        let mut entry = LogEntry::new_empty();
        entry.source_path = "/var/log/app.log".to_string();
        entry.line = "{not valid json".to_string();
        let keep = manager.run(&mut entry).await;

        assert!(keep, "a failed parse must never drop the line");
        assert!(entry.fields.is_empty());
        assert_eq!(entry.line, "{not valid json");
    }

    #[tokio::test]
    async fn structured_parser_stage_keeps_entry_on_leftover_text() {
        let store = fresh_store();
        let item = StageConfig {
            index: 0,
            stage_type: "structured_parser".to_string(),
            applies_to: None,
            params: HashMap::new(),
        };
        let manager = PipelineManager::from_config(&[item], &store).unwrap();

        let mut entry = LogEntry::new_empty();
        entry.source_path = "/var/log/app.log".to_string();
        entry.line = "plain text with nothing structured here".to_string();
        let keep = manager.run(&mut entry).await;

        assert!(keep, "leftover unmatched text must never drop the line");
        assert!(entry.fields.is_empty());
    }
}
