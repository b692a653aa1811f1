//! Per-host `Origin` / `Referer` / `User-Agent` overrides for upstream fetches.
//!
//! Many stream hosts refuse requests whose `Origin` or `Referer` do not name
//! their own player page. The client's values are always stripped before
//! forwarding; a matching rule then supplies the ones the host expects.
//!
//! Rules come from `UPSTREAM_HEADER_RULES` as a JSON array:
//!
//! ```json
//! [
//!   {"host": "*.svetacdn.in", "origin": "https://videocdn.tv", "referer": "https://videocdn.tv/"},
//!   {"host": "cdn.example.com", "origin": "self", "user_agent": "Mozilla/5.0 ..."}
//! ]
//! ```
//!
//! `host` is an exact hostname or `*.suffix` (subdomains only). The value
//! `self` stands for the target's own origin (`referer` gets a trailing `/`).
//! The first matching rule wins.

use axum::http::{HeaderMap, HeaderValue, header};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Placeholder for "the target's own origin".
const SELF_ORIGIN: &str = "self";

#[derive(Debug, Error)]
pub enum HeaderRuleError {
    #[error("UPSTREAM_HEADER_RULES is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("header rule has an empty host pattern")]
    EmptyHost,
    #[error("header rule for {host}: {field} is not a valid header value")]
    InvalidValue { host: String, field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeaderRule {
    pub host: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl HeaderRule {
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        match self.host.strip_prefix("*.") {
            Some(suffix) => {
                let (h, s) = (host.as_bytes(), suffix.as_bytes());
                h.len() > s.len() + 1
                    && h[h.len() - s.len()..].eq_ignore_ascii_case(s)
                    && h[h.len() - s.len() - 1] == b'.'
            }
            None => host.eq_ignore_ascii_case(&self.host),
        }
    }

    fn validate(&self) -> Result<(), HeaderRuleError> {
        if self.host.trim().is_empty() || self.host == "*." {
            return Err(HeaderRuleError::EmptyHost);
        }
        let fields = [
            ("origin", &self.origin),
            ("referer", &self.referer),
            ("user_agent", &self.user_agent),
        ];
        for (field, value) in fields {
            if let Some(v) = value
                && HeaderValue::from_str(v).is_err()
            {
                return Err(HeaderRuleError::InvalidValue {
                    host: self.host.clone(),
                    field,
                });
            }
        }
        Ok(())
    }
}

/// Ordered list of [`HeaderRule`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderRules(Vec<HeaderRule>);

impl HeaderRules {
    pub fn new(rules: Vec<HeaderRule>) -> Result<Self, HeaderRuleError> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self(rules))
    }

    /// Parse the JSON form used by `UPSTREAM_HEADER_RULES`.
    pub fn parse(json: &str) -> Result<Self, HeaderRuleError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::new(serde_json::from_str(json)?)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn find(&self, target: &Url) -> Option<&HeaderRule> {
        let host = target.host_str()?;
        self.0.iter().find(|rule| rule.matches(host))
    }

    /// Set the headers the first matching rule asks for. Empty values leave
    /// the header unset.
    pub fn apply(&self, target: &Url, headers: &mut HeaderMap) {
        let Some(rule) = self.find(target) else {
            return;
        };
        debug!("Applying header rule {} to {}", rule.host, target);

        let own_origin = target.origin().ascii_serialization();
        let resolve = |value: &str, trailing_slash: bool| -> String {
            if value.eq_ignore_ascii_case(SELF_ORIGIN) {
                if trailing_slash {
                    format!("{}/", own_origin)
                } else {
                    own_origin.clone()
                }
            } else {
                value.to_string()
            }
        };

        let fields = [
            (header::ORIGIN, rule.origin.as_deref(), false),
            (header::REFERER, rule.referer.as_deref(), true),
            (header::USER_AGENT, rule.user_agent.as_deref(), false),
        ];
        for (name, value, trailing_slash) in fields {
            let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            if let Ok(value) = HeaderValue::from_str(&resolve(value, trailing_slash)) {
                headers.insert(name, value);
            }
        }
    }
}
