// log-enricher - extract.rs
//
// 4.I Extractors: client-IP extraction, timestamp extraction, template
// resolver, and templated enrichment. Each keeps a per-source cache of
// "which field won last time" to short-circuit steady-state lines without
// re-scanning every candidate on every line.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::cache::PersistedCache;
use crate::model::{FieldValue, LogEntry};
use crate::util::error::EnrichmentError;

/// Sentinel stored in the client-IP cache when no candidate field has ever
/// produced an IP for a given source.
const NO_CANDIDATE_SENTINEL: &str = "";

// ---------------------------------------------------------------------------
// Client-IP extraction
// ---------------------------------------------------------------------------

pub struct ClientIpExtractor {
    candidates: Vec<String>,
    target_field: String,
    cache: Arc<PersistedCache<String>>,
}

impl ClientIpExtractor {
    pub fn new(candidates: Vec<String>, target_field: Option<String>, cache: Arc<PersistedCache<String>>) -> Self {
        ClientIpExtractor {
            candidates,
            target_field: target_field.unwrap_or_else(|| "client_ip".to_string()),
            cache,
        }
    }

    /// Cache key: source path plus current field count, so a negative cache
    /// entry doesn't wrongly short-circuit a line whose shape changed.
    fn cache_key(source_path: &str, field_count: usize) -> String {
        format!("{source_path}:{field_count}")
    }

    pub fn process(&self, entry: &mut LogEntry) {
        let key = Self::cache_key(&entry.source_path, entry.fields.len());

        if let Some(remembered) = self.cache.get(&key) {
            if remembered != NO_CANDIDATE_SENTINEL {
                if self.try_field(entry, &remembered) {
                    return;
                }
            } else {
                return;
            }
        }

        for candidate in &self.candidates {
            if self.try_field(entry, candidate) {
                self.cache.insert(key, candidate.clone());
                return;
            }
        }

        self.cache.insert(key, NO_CANDIDATE_SENTINEL.to_string());
    }

    fn try_field(&self, entry: &mut LogEntry, field: &str) -> bool {
        let Some(raw) = entry.fields.get(field).and_then(FieldValue::as_str_lossy) else {
            return false;
        };
        let Some(ip) = parse_ip_tolerating_port(&raw) else {
            return false;
        };

        let canonical = ip.to_string();
        if field != self.target_field {
            entry.fields.remove(field);
        }
        entry
            .fields
            .insert(self.target_field.clone(), FieldValue::String(canonical));
        true
    }
}

/// Parse a string as an IP address, tolerating an optional `host:port` form.
fn parse_ip_tolerating_port(raw: &str) -> Option<IpAddr> {
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Some((host, _port)) = raw.rsplit_once(':') {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Some(ip);
        }
        // Bracketed IPv6 with port, e.g. "[::1]:80".
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Some(ip);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Timestamp extraction
// ---------------------------------------------------------------------------

/// Layouts tried in order for each candidate field value.
const TIMESTAMP_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%:z",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%b %d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%z",
];

pub struct TimestampExtractor {
    fields: Vec<String>,
    /// (winning field, winning layout) per source path.
    cache: Arc<PersistedCache<(String, String)>>,
}

impl TimestampExtractor {
    pub fn new(extra_fields: Vec<String>, cache: Arc<PersistedCache<(String, String)>>) -> Self {
        let mut fields = vec!["timestamp".to_string(), "time".to_string()];
        fields.extend(extra_fields);
        TimestampExtractor { fields, cache }
    }

    pub fn process(&self, entry: &mut LogEntry) {
        if let Some((field, layout)) = self.cache.get(&entry.source_path) {
            if let Some(raw) = entry.fields.get(&field).and_then(FieldValue::as_str_lossy) {
                if let Some(ts) = try_layout(&raw, &layout) {
                    entry.timestamp = ts;
                    return;
                }
            }
        }

        for field in &self.fields {
            let Some(raw) = entry.fields.get(field).and_then(FieldValue::as_str_lossy) else {
                continue;
            };
            for layout in TIMESTAMP_LAYOUTS {
                if let Some(ts) = try_layout(&raw, layout) {
                    entry.timestamp = ts;
                    self.cache
                        .insert(entry.source_path.clone(), (field.clone(), layout.to_string()));
                    return;
                }
            }
        }
        // No match: leave the timestamp unchanged — the processor's
        // fallback later assigns "now".
    }
}

fn try_layout(raw: &str, layout: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, layout) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    None
}

// ---------------------------------------------------------------------------
// Template resolver / templated enrichment
// ---------------------------------------------------------------------------

/// Renders `{name}`-style placeholders against a variables map. Compiled
/// templates are cached by a hash of the original template string so a
/// repeated template string across many lines is parsed only once.
pub struct TemplateResolver {
    /// Field holding the template string to render.
    template_field: String,
    /// Optional dotted prefix path under `fields` from which to gather
    /// variables; when absent, variables are gathered by literal-prefix key
    /// iteration over the whole `fields` map.
    variables_prefix: Option<String>,
    /// Field to write the rendered string into.
    output_field: String,
    cache: Arc<PersistedCache<Vec<TemplatePart>>>,
}

/// A parsed template segment: literal text, or a variable reference.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TemplatePart {
    Literal(String),
    Var(String),
}

fn compile_template(template: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '{' {
            let mut name = String::new();
            let mut closed = false;
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    closed = true;
                    break;
                }
                name.push(c2);
            }
            if closed && !name.is_empty() {
                if !literal.is_empty() {
                    parts.push(TemplatePart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(TemplatePart::Var(name));
            } else {
                literal.push('{');
                literal.push_str(&name);
                if closed {
                    literal.push('}');
                }
            }
        } else {
            literal.push(c);
        }
    }
    if !literal.is_empty() {
        parts.push(TemplatePart::Literal(literal));
    }
    parts
}

fn template_hash(template: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    template.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

impl TemplateResolver {
    pub fn new(
        template_field: String,
        variables_prefix: Option<String>,
        output_field: String,
        cache: Arc<PersistedCache<Vec<TemplatePart>>>,
    ) -> Self {
        TemplateResolver {
            template_field,
            variables_prefix,
            output_field,
            cache,
        }
    }

    fn gather_variables(&self, entry: &LogEntry) -> HashMap<String, String> {
        match &self.variables_prefix {
            Some(prefix) => match entry.fields.get(prefix) {
                Some(FieldValue::Map(map)) => map
                    .iter()
                    .filter_map(|(k, v)| v.as_str_lossy().map(|s| (k.clone(), s)))
                    .collect(),
                _ => HashMap::new(),
            },
            None => entry
                .fields
                .iter()
                .filter_map(|(k, v)| v.as_str_lossy().map(|s| (k.clone(), s)))
                .collect(),
        }
    }

    pub fn process(&self, entry: &mut LogEntry) -> Result<(), EnrichmentError> {
        let Some(template) = entry.fields.get(&self.template_field).and_then(FieldValue::as_str_lossy)
        else {
            return Ok(());
        };

        let hash = template_hash(&template);
        let parts = match self.cache.get(&hash) {
            Some(cached) => cached,
            None => {
                let compiled = compile_template(&template);
                self.cache.insert(hash, compiled.clone());
                compiled
            }
        };

        let variables = self.gather_variables(entry);
        let mut rendered = String::new();
        for part in &parts {
            match part {
                TemplatePart::Literal(s) => rendered.push_str(s),
                TemplatePart::Var(name) => match variables.get(name) {
                    Some(v) => rendered.push_str(v),
                    None => {
                        return Err(EnrichmentError::TemplateRenderFailed {
                            template: template.clone(),
                            reason: format!("missing variable '{name}'"),
                        })
                    }
                },
            }
        }

        entry.fields.insert(self.output_field.clone(), FieldValue::String(rendered));
        Ok(())
    }
}

/// Templated enrichment: a pre-compiled template rendered against the
/// entry's fields at construction time (not re-read from a field each line).
pub struct TemplatedEnrichment {
    template: String,
    parts: Vec<TemplatePart>,
    output_field: String,
}

impl TemplatedEnrichment {
    pub fn new(template: &str, output_field: String) -> Self {
        TemplatedEnrichment {
            template: template.to_string(),
            parts: compile_template(template),
            output_field,
        }
    }

    /// Template errors are logged by the caller, not fatal.
    pub fn process(&self, entry: &mut LogEntry) -> Result<(), EnrichmentError> {
        let variables: HashMap<String, String> = entry
            .fields
            .iter()
            .filter_map(|(k, v)| v.as_str_lossy().map(|s| (k.clone(), s)))
            .collect();

        let mut rendered = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(s) => rendered.push_str(s),
                TemplatePart::Var(name) => match variables.get(name) {
                    Some(v) => rendered.push_str(v),
                    None => {
                        return Err(EnrichmentError::TemplateRenderFailed {
                            template: self.template.clone(),
                            reason: format!("missing variable '{name}'"),
                        })
                    }
                },
            }
        }
        entry.fields.insert(self.output_field.clone(), FieldValue::String(rendered));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use tempfile::TempDir;

    fn fresh_store() -> StateStore {
        let dir = TempDir::new().unwrap();
        StateStore::load(&dir.path().join("state.json")).unwrap()
    }

    #[test]
    fn client_ip_extraction_normalises_and_picks_first_candidate() {
        let store = fresh_store();
        let cache = PersistedCache::new("ip_extract", false, &store);
        let extractor =
            ClientIpExtractor::new(vec!["remote_addr".to_string(), "x_forwarded_for".to_string()], None, cache);

        let mut entry = LogEntry::new_empty();
        entry.source_path = "/a.log".to_string();
        entry
            .fields
            .insert("remote_addr".to_string(), FieldValue::String("10.0.0.5:4433".to_string()));

        extractor.process(&mut entry);
        assert_eq!(
            entry.fields.get("client_ip"),
            Some(&FieldValue::String("10.0.0.5".to_string()))
        );
        assert!(!entry.fields.contains_key("remote_addr"));
    }

    #[test]
    fn client_ip_extraction_no_candidate_caches_negative() {
        let store = fresh_store();
        let cache = PersistedCache::new("ip_extract2", false, &store);
        let extractor = ClientIpExtractor::new(vec!["remote_addr".to_string()], None, cache);

        let mut entry = LogEntry::new_empty();
        entry.source_path = "/a.log".to_string();
        extractor.process(&mut entry);
        assert!(!entry.fields.contains_key("client_ip"));
    }

    #[test]
    fn timestamp_extraction_rfc3339() {
        let store = fresh_store();
        let cache = PersistedCache::new("ts_extract", false, &store);
        let extractor = TimestampExtractor::new(vec![], cache);

        let mut entry = LogEntry::new_empty();
        entry.source_path = "/a.log".to_string();
        entry.fields.insert(
            "timestamp".to_string(),
            FieldValue::String("2026-01-02T03:04:05.000000006Z".to_string()),
        );
        extractor.process(&mut entry);
        assert!(!entry.is_timestamp_zero());
        assert_eq!(entry.timestamp.format("%Y-%m-%d").to_string(), "2026-01-02");
    }

    #[test]
    fn timestamp_extraction_leaves_unchanged_on_no_match() {
        let store = fresh_store();
        let cache = PersistedCache::new("ts_extract2", false, &store);
        let extractor = TimestampExtractor::new(vec![], cache);

        let mut entry = LogEntry::new_empty();
        entry.source_path = "/a.log".to_string();
        extractor.process(&mut entry);
        assert!(entry.is_timestamp_zero());
    }

    #[test]
    fn template_resolver_renders_placeholders() {
        let store = fresh_store();
        let cache = PersistedCache::new("tmpl", false, &store);
        let resolver =
            TemplateResolver::new("tmpl".to_string(), None, "rendered".to_string(), cache);

        let mut entry = LogEntry::new_empty();
        entry
            .fields
            .insert("tmpl".to_string(), FieldValue::String("hello {name}!".to_string()));
        entry
            .fields
            .insert("name".to_string(), FieldValue::String("world".to_string()));

        resolver.process(&mut entry).unwrap();
        assert_eq!(
            entry.fields.get("rendered"),
            Some(&FieldValue::String("hello world!".to_string()))
        );
    }

    #[test]
    fn templated_enrichment_missing_variable_errors() {
        let enrichment = TemplatedEnrichment::new("{missing}", "out".to_string());
        let mut entry = LogEntry::new_empty();
        assert!(enrichment.process(&mut entry).is_err());
    }
}
