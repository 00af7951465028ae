//! Rate limit rules configuration and matching.
//!
//! Rules are loaded from a YAML document with a top-level `rules` sequence.
//! Each entry carries a `type` discriminator (`ip`, `path` or `ip_path`),
//! a positive `limit` and `window` (seconds), and the fields its kind needs:
//!
//! ```yaml
//! rules:
//!   - type: ip
//!     ip: 192.168.1.1
//!     limit: 100
//!     window: 60
//!   - type: path
//!     pattern: items/*
//!     limit: 1000
//!     window: 60
//!   - type: ip_path
//!     ip: 10.0.0.5
//!     pattern: categories/*
//!     limit: 10
//!     window: 1
//! ```
//!
//! A record that fails validation is logged and dropped; its siblings are
//! still loaded. A document without a `rules` section is rejected outright.

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::pattern;
use crate::error::{Result, TurnstileError};

/// Prefix shared by every counter key a rule generates.
const KEY_PREFIX: &str = "limit";

/// Longest window a rule may declare: one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Reasons a single rule record can be rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule entry must be a mapping")]
    NotAMapping,

    #[error("rule entry has no `type`")]
    MissingKind,

    #[error("unknown rule type `{0}`")]
    UnknownKind(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be a positive integer, got {value}")]
    NotPositive { field: &'static str, value: String },

    #[error("field `{field}` must be a string, got {value}")]
    NotAString { field: &'static str, value: String },

    #[error("field `window` must be at most {max} seconds, got {value}")]
    WindowTooLong { value: u64, max: u64 },

    #[error("`{0}` is not a valid IPv4 address")]
    InvalidIp(String),

    #[error("pattern must not be empty")]
    EmptyPattern,
}

/// What a rule matches on. The set of kinds is closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Requests from one client address.
    Ip { ip: String },
    /// Requests whose path matches a glob pattern, from any client.
    Path { pattern: String },
    /// Requests from one client address whose path matches a glob pattern.
    IpPath { ip: String, pattern: String },
}

impl RuleKind {
    /// The discriminator used for this kind in configuration and keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Ip { .. } => "ip",
            RuleKind::Path { .. } => "path",
            RuleKind::IpPath { .. } => "ip_path",
        }
    }
}

/// A validated rate limit rule: a request predicate plus a fixed-window quota.
///
/// Rules can only be built through the validating constructors, so every
/// `Rule` in circulation has a positive limit, a window of at most
/// [`MAX_WINDOW_SECS`], a well-formed IPv4 address where one is needed and a
/// non-empty pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Rule {
    #[serde(flatten)]
    kind: RuleKind,
    limit: u64,
    window: u64,
}

impl Rule {
    /// Build a rule of any kind, validating every field.
    pub fn new(kind: RuleKind, limit: u64, window: u64) -> std::result::Result<Self, RuleError> {
        if limit == 0 {
            return Err(RuleError::NotPositive {
                field: "limit",
                value: limit.to_string(),
            });
        }
        if window == 0 {
            return Err(RuleError::NotPositive {
                field: "window",
                value: window.to_string(),
            });
        }
        if window > MAX_WINDOW_SECS {
            return Err(RuleError::WindowTooLong {
                value: window,
                max: MAX_WINDOW_SECS,
            });
        }

        match &kind {
            RuleKind::Ip { ip } => validate_ip(ip)?,
            RuleKind::Path { pattern } => validate_pattern(pattern)?,
            RuleKind::IpPath { ip, pattern } => {
                validate_ip(ip)?;
                validate_pattern(pattern)?;
            }
        }

        Ok(Self { kind, limit, window })
    }

    /// Limit requests from a single IPv4 address.
    pub fn ip(ip: impl Into<String>, limit: u64, window: u64) -> std::result::Result<Self, RuleError> {
        Self::new(RuleKind::Ip { ip: ip.into() }, limit, window)
    }

    /// Limit requests to paths matching `pattern`.
    pub fn path(
        pattern: impl Into<String>,
        limit: u64,
        window: u64,
    ) -> std::result::Result<Self, RuleError> {
        Self::new(
            RuleKind::Path {
                pattern: pattern.into(),
            },
            limit,
            window,
        )
    }

    /// Limit requests from `ip` to paths matching `pattern`.
    pub fn ip_path(
        ip: impl Into<String>,
        pattern: impl Into<String>,
        limit: u64,
        window: u64,
    ) -> std::result::Result<Self, RuleError> {
        Self::new(
            RuleKind::IpPath {
                ip: ip.into(),
                pattern: pattern.into(),
            },
            limit,
            window,
        )
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    /// Maximum number of requests admitted per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.window
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window)
    }

    /// Whether this rule applies to a request from `ip` for `path`.
    ///
    /// Address comparison is exact string equality.
    pub fn matches(&self, ip: &str, path: &str) -> bool {
        match &self.kind {
            RuleKind::Ip { ip: rule_ip } => ip == rule_ip,
            RuleKind::Path { pattern } => pattern::matches(path, pattern),
            RuleKind::IpPath {
                ip: rule_ip,
                pattern,
            } => ip == rule_ip && pattern::matches(path, pattern),
        }
    }

    /// The counter key this rule counts against.
    ///
    /// The key is built from the rule's own fields only, so every request a
    /// rule matches shares one counter. The kind tag keeps keys of different
    /// kinds apart, and the trailing `limit:window` pair keeps tiered rules on
    /// the same target (a short burst limit next to a long sustained one) on
    /// separate counters.
    pub fn key(&self) -> String {
        let quota = format!("{}:{}", self.limit, self.window);
        match &self.kind {
            RuleKind::Ip { ip } => format!("{KEY_PREFIX}:ip:{ip}:{quota}"),
            RuleKind::Path { pattern } => format!("{KEY_PREFIX}:path:{pattern}:{quota}"),
            RuleKind::IpPath { ip, pattern } => {
                format!("{KEY_PREFIX}:ip_path:{ip}:{pattern}:{quota}")
            }
        }
    }

    /// Parse one untyped configuration record.
    ///
    /// Returns `Ok(None)` for a record whose `type` is not one this version
    /// understands.
    pub fn from_value(value: &Value) -> std::result::Result<Option<Self>, RuleError> {
        let record = value.as_mapping().ok_or(RuleError::NotAMapping)?;
        let kind = match record.get("type") {
            None | Some(Value::Null) => return Err(RuleError::MissingKind),
            Some(kind) => kind.as_str().ok_or_else(|| RuleError::NotAString {
                field: "type",
                value: render(kind),
            })?,
        };

        let kind = match kind {
            "ip" => RuleKind::Ip {
                ip: string_field(record, "ip")?,
            },
            "path" => RuleKind::Path {
                pattern: string_field(record, "pattern")?,
            },
            "ip_path" => RuleKind::IpPath {
                ip: string_field(record, "ip")?,
                pattern: string_field(record, "pattern")?,
            },
            _ => return Ok(None),
        };

        let limit = positive_field(record, "limit")?;
        let window = positive_field(record, "window")?;
        Self::new(kind, limit, window).map(Some)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RuleKind::Ip { ip } => write!(f, "ip={ip}")?,
            RuleKind::Path { pattern } => write!(f, "path={pattern}")?,
            RuleKind::IpPath { ip, pattern } => write!(f, "ip={ip} path={pattern}")?,
        }
        write!(f, " limit={}/{}s", self.limit, self.window)
    }
}

fn validate_ip(ip: &str) -> std::result::Result<(), RuleError> {
    ip.parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| RuleError::InvalidIp(ip.to_string()))
}

fn validate_pattern(pattern: &str) -> std::result::Result<(), RuleError> {
    if pattern.is_empty() {
        Err(RuleError::EmptyPattern)
    } else {
        Ok(())
    }
}

fn string_field(record: &Mapping, field: &'static str) -> std::result::Result<String, RuleError> {
    match record.get(field) {
        None | Some(Value::Null) => Err(RuleError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(RuleError::NotAString {
            field,
            value: render(other),
        }),
    }
}

fn positive_field(record: &Mapping, field: &'static str) -> std::result::Result<u64, RuleError> {
    match record.get(field) {
        None | Some(Value::Null) => Err(RuleError::MissingField(field)),
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => Ok(n),
            _ => Err(RuleError::NotPositive {
                field,
                value: render(value),
            }),
        },
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::Sequence(_) => "a sequence".to_string(),
        Value::Mapping(_) => "a mapping".to_string(),
        Value::Tagged(tagged) => format!("tagged value {}", tagged.tag),
    }
}

/// An ordered, immutable set of rules.
///
/// Rules are evaluated in declaration order. Reconfiguration builds a new
/// `RuleSet` rather than modifying one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Fails if the document is not valid YAML or lacks a `rules` sequence.
    /// Individual bad records are dropped, not fatal.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: Value = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rules file: {}", e)))?;

        let records = match document.get("rules") {
            Some(Value::Sequence(records)) => records,
            Some(_) => {
                return Err(TurnstileError::Config(
                    "`rules` must be a sequence".to_string(),
                ))
            }
            None => {
                return Err(TurnstileError::Config(
                    "missing top-level `rules` section".to_string(),
                ))
            }
        };

        Ok(parse_rules(records))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

impl FromIterator<Rule> for RuleSet {
    fn from_iter<I: IntoIterator<Item = Rule>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

/// Turn untyped rule records into a `RuleSet`.
///
/// Records of an unknown type are skipped with a warning. Records that fail
/// validation are logged and dropped; the remaining records still load.
pub fn parse_rules(records: &[Value]) -> RuleSet {
    let mut rules = Vec::with_capacity(records.len());

    for (index, record) in records.iter().enumerate() {
        match Rule::from_value(record) {
            Ok(Some(rule)) => {
                debug!(index, rule = %rule, "Parsed rate limit rule");
                rules.push(rule);
            }
            Ok(None) => {
                let kind = record.get("type").and_then(Value::as_str).unwrap_or_default();
                warn!(index, kind, "Unknown rule type, skipping");
            }
            Err(e) => {
                error!(index, error = %e, "Invalid rate limit rule, skipping");
            }
        }
    }

    RuleSet::new(rules)
}
