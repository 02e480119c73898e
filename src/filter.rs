// log-enricher - filter.rs
//
// 4.J Filter stage: keep/drop rule engine over regex/size/age/field-regex
// rules, with any/all combination semantics.

use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;

use crate::model::{FieldValue, LogEntry};

/// Combination mode across configured rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Any,
    All,
}

impl Default for MatchMode {
    fn default() -> Self {
        MatchMode::Any
    }
}

/// Action taken when the combined rule evaluation is true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Keep,
    Drop,
}

impl Default for FilterAction {
    fn default() -> Self {
        FilterAction::Drop
    }
}

/// A single filter rule. Each answers "does this entry match?" independently
/// of the others.
pub enum FilterRule {
    Regex(Regex),
    MinSize(usize),
    MaxSize(usize),
    MaxAge(ChronoDuration),
    FieldRegex { field: String, pattern: Regex },
}

impl FilterRule {
    fn matches(&self, entry: &LogEntry) -> bool {
        match self {
            FilterRule::Regex(re) => re.is_match(&entry.line),
            FilterRule::MinSize(min) => entry.line.len() < *min,
            FilterRule::MaxSize(max) => entry.line.len() > *max,
            FilterRule::MaxAge(max_age) => {
                if entry.is_timestamp_zero() {
                    false
                } else {
                    Utc::now() - entry.timestamp > *max_age
                }
            }
            FilterRule::FieldRegex { field, pattern } => entry
                .fields
                .get(field)
                .and_then(FieldValue::as_str_lossy)
                .map(|v| pattern.is_match(&v))
                .unwrap_or(false),
        }
    }
}

pub struct FilterStage {
    rules: Vec<FilterRule>,
    mode: MatchMode,
    action: FilterAction,
}

impl FilterStage {
    pub fn new(rules: Vec<FilterRule>, mode: MatchMode, action: FilterAction) -> Self {
        FilterStage { rules, mode, action }
    }

    fn combined_match(&self, entry: &LogEntry) -> bool {
        if self.rules.is_empty() {
            // No rules configured: keep.
            return false;
        }
        match self.mode {
            MatchMode::Any => self.rules.iter().any(|r| r.matches(entry)),
            MatchMode::All => self.rules.iter().all(|r| r.matches(entry)),
        }
    }

    /// Returns `true` if the entry should be kept.
    pub fn process(&self, entry: &LogEntry) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let combined = self.combined_match(entry);
        (self.action == FilterAction::Keep) == combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_line(line: &str) -> LogEntry {
        let mut e = LogEntry::new_empty();
        e.line = line.to_string();
        e
    }

    #[test]
    fn no_rules_always_keeps() {
        let stage = FilterStage::new(vec![], MatchMode::Any, FilterAction::Drop);
        assert!(stage.process(&entry_with_line("healthcheck")));
    }

    #[test]
    fn drop_action_on_regex_match() {
        let rule = FilterRule::Regex(Regex::new("(?i)healthcheck").unwrap());
        let stage = FilterStage::new(vec![rule], MatchMode::Any, FilterAction::Drop);

        assert!(stage.process(&entry_with_line(r#"{"msg":"ok"}"#)));
        assert!(!stage.process(&entry_with_line(r#"{"msg":"HealthCheck"}"#)));
    }

    #[test]
    fn keep_action_inverts_outcome() {
        let rule = FilterRule::Regex(Regex::new("error").unwrap());
        let stage = FilterStage::new(vec![rule], MatchMode::Any, FilterAction::Keep);

        assert!(stage.process(&entry_with_line("an error occurred")));
        assert!(!stage.process(&entry_with_line("all fine")));
    }

    #[test]
    fn all_mode_requires_every_rule() {
        let rules = vec![
            FilterRule::Regex(Regex::new("error").unwrap()),
            FilterRule::MinSize(5),
        ];
        let stage = FilterStage::new(rules, MatchMode::All, FilterAction::Drop);

        // "error" matches the regex but is shorter than MinSize(5)'s
        // threshold check (MinSize matches when line.len() < 5, which is
        // false here), so not all rules match -> kept.
        assert!(stage.process(&entry_with_line("error")));
    }

    #[test]
    fn max_age_rule_drops_stale_entries() {
        let mut entry = entry_with_line("old");
        entry.timestamp = Utc::now() - ChronoDuration::hours(2);
        let rule = FilterRule::MaxAge(ChronoDuration::hours(1));
        let stage = FilterStage::new(vec![rule], MatchMode::Any, FilterAction::Drop);
        assert!(!stage.process(&entry));
    }

    #[test]
    fn field_regex_rule_matches_named_field() {
        let mut entry = entry_with_line("line");
        entry
            .fields
            .insert("status".to_string(), FieldValue::String("500".to_string()));
        let rule = FilterRule::FieldRegex {
            field: "status".to_string(),
            pattern: Regex::new("^5").unwrap(),
        };
        let stage = FilterStage::new(vec![rule], MatchMode::Any, FilterAction::Drop);
        assert!(!stage.process(&entry));
    }
}
