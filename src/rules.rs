//! Target rules: which hosts are intercepted and what happens to their exchanges

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::http::exchange::request_path;
use crate::http::CapturedExchange;

/// A path pattern under a target host.
///
/// Matching is exact string equality against the request path (query
/// removed). An empty pattern matches every path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyPath {
    pub path: String,
    pub capture: bool,
    pub notify: bool,
}

impl ProxyPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            capture: true,
            notify: true,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.path.is_empty() || self.path == path
    }
}

/// Accepts either `"/foo"` or `{ path = "/foo", notify = false }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProxyPathRaw {
    Path(String),
    Table {
        path: String,
        #[serde(default = "default_true")]
        capture: bool,
        #[serde(default = "default_true")]
        notify: bool,
    },
}

fn default_true() -> bool {
    true
}

impl<'de> Deserialize<'de> for ProxyPath {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match ProxyPathRaw::deserialize(deserializer)? {
            ProxyPathRaw::Path(path) => ProxyPath::new(path),
            ProxyPathRaw::Table {
                path,
                capture,
                notify,
            } => ProxyPath {
                path,
                capture,
                notify,
            },
        })
    }
}

/// One intercepted host and its per-path flags.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyTarget {
    /// Compared verbatim with the request `Host` header, port included.
    pub host: String,

    #[serde(default)]
    pub paths: Vec<ProxyPath>,

    /// Capture every exchange on this host unless a path opts out.
    #[serde(default = "default_true")]
    pub capture: bool,

    /// Allow notifications for this host. Which paths notify is decided by `paths`.
    #[serde(default = "default_true")]
    pub notify: bool,
}

impl ProxyTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            paths: Vec::new(),
            capture: true,
            notify: true,
        }
    }

    pub fn with_path(mut self, path: ProxyPath) -> Self {
        self.paths.push(path);
        self
    }

    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    fn captures(&self, path: &str) -> bool {
        self.capture
            && !self
                .paths
                .iter()
                .any(|p| !p.capture && !p.path.is_empty() && p.path == path)
    }

    fn notifies(&self, path: &str) -> bool {
        self.notify && self.paths.iter().any(|p| p.notify && p.matches(path))
    }
}

/// Side effects due for one finalized exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Effects {
    pub capture: bool,
    pub notify: bool,
}

impl Effects {
    pub fn is_none(&self) -> bool {
        !self.capture && !self.notify
    }
}

/// Immutable set of targets, at most one per host.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    targets: Vec<ProxyTarget>,
    by_host: HashMap<String, usize>,
}

impl RuleSet {
    /// Build a rule set, rejecting empty and duplicate hosts.
    pub fn new(targets: Vec<ProxyTarget>) -> Result<Self> {
        let mut by_host = HashMap::with_capacity(targets.len());

        for (i, target) in targets.iter().enumerate() {
            let ctx = |msg: String| Error::config(format!("Target #{}: {}", i + 1, msg));

            if target.host.trim().is_empty() {
                return Err(ctx("`host` must not be empty".to_string()));
            }
            if target.host.contains('/') || target.host.contains(char::is_whitespace) {
                return Err(ctx(format!("invalid host {:?}", target.host)));
            }
            if let Some(first) = by_host.insert(target.host.clone(), i) {
                return Err(ctx(format!(
                    "host {:?} is already defined by target #{}",
                    target.host,
                    first + 1
                )));
            }
        }

        Ok(Self { targets, by_host })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn target_for(&self, host: &str) -> Option<&ProxyTarget> {
        self.by_host.get(host).map(|&i| &self.targets[i])
    }

    /// Whether a CONNECT to `host` should be TLS-terminated.
    ///
    /// The CONNECT authority has no port when it is 443, while the inner
    /// `Host` header may, so both spellings are checked.
    pub fn is_target_host(&self, host: &str, port: u16) -> bool {
        self.by_host.contains_key(host) || self.by_host.contains_key(&format!("{}:{}", host, port))
    }

    pub fn should_capture(&self, host: &str, path: &str) -> bool {
        self.target_for(host)
            .map(|t| t.captures(request_path(path)))
            .unwrap_or(false)
    }

    pub fn should_notify(&self, host: &str, path: &str) -> bool {
        self.target_for(host)
            .map(|t| t.notifies(request_path(path)))
            .unwrap_or(false)
    }

    pub fn effects(&self, exchange: &CapturedExchange) -> Effects {
        Effects {
            capture: self.should_capture(&exchange.host, &exchange.path),
            notify: self.should_notify(&exchange.host, &exchange.path),
        }
    }

    pub fn targets(&self) -> &[ProxyTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
