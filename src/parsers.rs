// log-enricher - parsers.rs
//
// 4.H Parsers: the JSON-object parser and the configurable regex
// structured-parser, each with a per-stage success/failure cache.
//
// Both share the same contract: never drop a line, no-op if `fields`
// already has entries (another parser already succeeded), and consult a
// cache keyed by `source_path + first_byte` (or `source_path + ":empty"`)
// so a steady-state stream of identically-shaped lines only pays the real
// parse cost once.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value as JsonValue;

use crate::cache::PersistedCache;
use crate::model::{FieldValue, LogEntry};
use crate::util::error::ParseError;

/// Cache key for a parser's success/failure memo: the source path plus the
/// line's first byte (or a sentinel for empty lines).
fn cache_key(source_path: &str, line: &str) -> String {
    match line.as_bytes().first() {
        Some(b) => format!("{source_path}:{}", *b as char),
        None => format!("{source_path}:empty"),
    }
}

/// JSON-object parser: attempts parsing iff the first byte is `{`.
pub struct JsonParser {
    cache: Arc<PersistedCache<bool>>,
}

impl JsonParser {
    pub fn new(cache: Arc<PersistedCache<bool>>) -> Self {
        JsonParser { cache }
    }

    /// Returns `true` if the line was (or had already been) successfully
    /// parsed into `fields`. Never drops the line either way.
    pub fn process(&self, entry: &mut LogEntry) -> bool {
        if !entry.fields.is_empty() {
            return true;
        }

        let key = cache_key(&entry.source_path, &entry.line);
        if let Some(false) = self.cache.get(&key) {
            return false;
        }

        if entry.line.as_bytes().first() != Some(&b'{') {
            self.cache.insert(key, false);
            return false;
        }

        match serde_json::from_str::<JsonValue>(&entry.line) {
            Ok(JsonValue::Object(map)) => {
                for (k, v) in map {
                    entry.fields.insert(k, FieldValue::from(v));
                }
                self.cache.insert(key, true);
                true
            }
            _ => {
                entry.fields.clear();
                self.cache.insert(key, false);
                false
            }
        }
    }
}

/// How a compiled structured-parser pattern populates fields.
enum PatternMode {
    /// Named capture groups are used directly as field keys.
    Named,
    /// Exactly two unnamed groups: (key, value), iterated across all matches.
    KeyValue,
}

/// Structured (regex) parser. The pattern must have either named
/// capture groups or exactly two unnamed groups; any other shape is
/// rejected at construction.
pub struct StructuredParser {
    pattern: Regex,
    mode: PatternMode,
    cache: Arc<PersistedCache<bool>>,
}

/// Default pattern when none is configured: `key=value` or
/// `key="value with spaces"`.
pub const DEFAULT_STRUCTURED_PATTERN: &str = r#"(\S+?)=("[^"]*"|\S+)"#;

impl StructuredParser {
    pub fn new(pattern: &str, cache: Arc<PersistedCache<bool>>) -> Result<Self, ParseError> {
        let re = Regex::new(pattern).map_err(|source| ParseError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;

        let named: Vec<&str> = re.capture_names().flatten().collect();
        let total_groups = re.captures_len() - 1; // exclude whole-match group 0

        let mode = if !named.is_empty() {
            PatternMode::Named
        } else if total_groups == 2 {
            PatternMode::KeyValue
        } else {
            return Err(ParseError::InvalidPatternShape {
                pattern: pattern.to_string(),
                reason: format!(
                    "pattern must have named capture groups or exactly two unnamed groups, found {total_groups} unnamed"
                ),
            });
        };

        Ok(StructuredParser {
            pattern: re,
            mode,
            cache,
        })
    }

    pub fn process(&self, entry: &mut LogEntry) -> bool {
        if !entry.fields.is_empty() {
            return true;
        }

        let key = cache_key(&entry.source_path, &entry.line);
        if let Some(false) = self.cache.get(&key) {
            return false;
        }

        let ok = match self.mode {
            PatternMode::Named => self.process_named(entry),
            PatternMode::KeyValue => self.process_key_value(entry),
        };

        self.cache.insert(key, ok);
        ok
    }

    /// Named-group mode: one match attempt; named groups populate fields.
    fn process_named(&self, entry: &mut LogEntry) -> bool {
        let Some(caps) = self.pattern.captures(&entry.line) else {
            return false;
        };
        for name in self.pattern.capture_names().flatten() {
            if let Some(m) = caps.name(name) {
                entry
                    .fields
                    .insert(name.to_string(), FieldValue::String(m.as_str().to_string()));
            }
        }
        true
    }

    /// Key/value mode: iterate all matches. Leftover non-whitespace text
    /// between matches is a failure; on failure fields populated so far are
    /// cleared.
    fn process_key_value(&self, entry: &mut LogEntry) -> bool {
        let line = entry.line.clone();
        let mut fields: HashMap<String, FieldValue> = HashMap::new();
        let mut cursor = 0usize;

        for caps in self.pattern.captures_iter(&line) {
            let whole = caps.get(0).unwrap();
            let leftover = &line[cursor..whole.start()];
            if !leftover.trim().is_empty() {
                entry.fields.clear();
                return false;
            }
            let key = caps.get(1).unwrap().as_str().to_string();
            let value = unquote(caps.get(2).unwrap().as_str());
            fields.insert(key, FieldValue::String(value));
            cursor = whole.end();
        }

        let trailing = &line[cursor..];
        if !trailing.trim().is_empty() {
            entry.fields.clear();
            return false;
        }

        if fields.is_empty() {
            return false;
        }

        entry.fields.extend(fields);
        true
    }
}

/// Strip one layer of enclosing double quotes, if present.
fn unquote(s: &str) -> String {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateStore;
    use tempfile::TempDir;

    fn fresh_cache() -> Arc<PersistedCache<bool>> {
        let dir = TempDir::new().unwrap();
        let store = StateStore::load(&dir.path().join("state.json")).unwrap();
        PersistedCache::new("parser_test", false, &store)
    }

    fn entry(line: &str) -> LogEntry {
        let mut e = LogEntry::new_empty();
        e.source_path = "/var/log/app.log".to_string();
        e.line = line.to_string();
        e
    }

    #[test]
    fn json_parser_populates_top_level_keys() {
        let parser = JsonParser::new(fresh_cache());
        let mut e = entry(r#"{"level":"info","count":3}"#);
        assert!(parser.process(&mut e));
        assert_eq!(
            e.fields.get("level"),
            Some(&FieldValue::String("info".to_string()))
        );
        assert_eq!(e.fields.get("count"), Some(&FieldValue::Number(3.0)));
    }

    #[test]
    fn json_parser_skips_non_json_and_keeps_empty_fields() {
        let parser = JsonParser::new(fresh_cache());
        let mut e = entry("plain text line");
        assert!(!parser.process(&mut e));
        assert!(e.fields.is_empty());
    }

    #[test]
    fn json_parser_noops_when_fields_already_populated() {
        let parser = JsonParser::new(fresh_cache());
        let mut e = entry(r#"{"a":1}"#);
        e.fields.insert("existing".into(), FieldValue::Bool(true));
        assert!(parser.process(&mut e));
        assert!(!e.fields.contains_key("a"));
    }

    #[test]
    fn structured_parser_rejects_single_unnamed_group() {
        let result = StructuredParser::new(r"(a)", fresh_cache());
        assert!(matches!(result, Err(ParseError::InvalidPatternShape { .. })));
    }

    #[test]
    fn structured_parser_default_pattern_key_value() {
        let parser = StructuredParser::new(DEFAULT_STRUCTURED_PATTERN, fresh_cache()).unwrap();
        let mut e = entry(r#"level=info msg="hello world""#);
        assert!(parser.process(&mut e));
        assert_eq!(
            e.fields.get("level"),
            Some(&FieldValue::String("info".to_string()))
        );
        assert_eq!(
            e.fields.get("msg"),
            Some(&FieldValue::String("hello world".to_string()))
        );
    }

    #[test]
    fn structured_parser_leftover_text_fails_and_clears() {
        let parser = StructuredParser::new(DEFAULT_STRUCTURED_PATTERN, fresh_cache()).unwrap();
        let mut e = entry("level=info trailing-text");
        assert!(!parser.process(&mut e));
        assert!(e.fields.is_empty());
    }

    #[test]
    fn structured_parser_named_groups() {
        let parser = StructuredParser::new(r"(?P<lvl>\w+): (?P<msg>.*)", fresh_cache()).unwrap();
        let mut e = entry("info: something happened");
        assert!(parser.process(&mut e));
        assert_eq!(
            e.fields.get("lvl"),
            Some(&FieldValue::String("info".to_string()))
        );
    }
}
