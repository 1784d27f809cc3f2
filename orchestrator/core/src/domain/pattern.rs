// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Glob matching shared by record queries and event topic subscriptions.
//!
//! `*` matches any run of characters (including `.` and `/`), `?` matches a
//! single character. Everything else is literal.

use regex::Regex;

#[derive(Debug, thiserror::Error)]
#[error("invalid pattern '{pattern}': {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
    literal_prefix: String,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        for c in pattern.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(&other.to_string())),
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| PatternError {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let literal_prefix = pattern
            .split(['*', '?'])
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            raw: pattern.to_string(),
            regex,
            literal_prefix,
        })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    /// Text before the first wildcard; used to narrow ordered scans.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_wildcards(pattern: &str) -> bool {
        pattern.contains(['*', '?'])
    }
}

/// Key selector for record queries.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    All,
    Prefix(String),
    Glob(GlobPattern),
}

impl KeyPattern {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyPattern::Prefix(prefix.into())
    }

    pub fn glob(pattern: &str) -> Result<Self, PatternError> {
        Ok(KeyPattern::Glob(GlobPattern::new(pattern)?))
    }

    /// Wildcards make a glob, anything else is a prefix.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            Ok(KeyPattern::All)
        } else if GlobPattern::has_wildcards(pattern) {
            Self::glob(pattern)
        } else {
            Ok(Self::prefix(pattern))
        }
    }

    pub fn scan_prefix(&self) -> &str {
        match self {
            KeyPattern::All => "",
            KeyPattern::Prefix(p) => p,
            KeyPattern::Glob(g) => g.literal_prefix(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::All => true,
            KeyPattern::Prefix(p) => key.starts_with(p.as_str()),
            KeyPattern::Glob(g) => g.matches(key),
        }
    }
}

/// Topic selector for event subscriptions.
#[derive(Debug, Clone)]
pub enum TopicPattern {
    Exact(String),
    Glob(GlobPattern),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if GlobPattern::has_wildcards(pattern) {
            Ok(TopicPattern::Glob(GlobPattern::new(pattern)?))
        } else {
            Ok(TopicPattern::Exact(pattern.to_string()))
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicPattern::Exact(t) => t == topic,
            TopicPattern::Glob(g) => g.matches(topic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        let glob = GlobPattern::new("agent.lifecycle.*").unwrap();
        assert!(glob.matches("agent.lifecycle.ready"));
        assert!(glob.matches("agent.lifecycle."));
        assert!(!glob.matches("agent.lifecycleX"));
        assert!(!glob.matches("task.assigned"));
        assert_eq!(glob.literal_prefix(), "agent.lifecycle.");
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let glob = GlobPattern::new("task/(1)+?").unwrap();
        assert!(glob.matches("task/(1)+x"));
        assert!(!glob.matches("task/11x"));
    }

    #[test]
    fn test_key_pattern_parse() {
        assert!(matches!(KeyPattern::parse("").unwrap(), KeyPattern::All));
        assert!(matches!(KeyPattern::parse("task/").unwrap(), KeyPattern::Prefix(_)));
        let glob = KeyPattern::parse("agent/*/state").unwrap();
        assert!(glob.matches("agent/42/state"));
        assert!(!glob.matches("agent/42/result"));
        assert_eq!(glob.scan_prefix(), "agent/");
    }

    #[test]
    fn test_topic_pattern_exact() {
        let topic = TopicPattern::parse("task.assigned").unwrap();
        assert!(topic.matches("task.assigned"));
        assert!(!topic.matches("task.assigned.extra"));
    }
}
