use super::{RouteError, DEFAULT_RATE_CLASS};
use crate::auth::Role;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// A path prefix bound to one backend service and its access policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub prefix: String,

    #[serde(alias = "target")]
    pub target_base_url: String,

    #[serde(default)]
    pub requires_auth: bool,

    /// Empty means any authenticated role is accepted.
    #[serde(default)]
    pub allowed_roles: BTreeSet<Role>,

    #[serde(default = "default_rate_class")]
    pub rate_class: String,
}

fn default_rate_class() -> String {
    DEFAULT_RATE_CLASS.to_string()
}

impl RouteSpec {
    pub fn new(prefix: impl Into<String>, target_base_url: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            target_base_url: target_base_url.into(),
            requires_auth: false,
            allowed_roles: BTreeSet::new(),
            rate_class: default_rate_class(),
        }
    }

    pub fn with_auth(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.requires_auth = true;
        self.allowed_roles = roles.into_iter().collect();
        self
    }

    pub fn with_rate_class(mut self, rate_class: impl Into<String>) -> Self {
        self.rate_class = rate_class.into();
        self
    }

    /// Whether `path` falls under this prefix on a segment boundary.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path left over once the prefix is stripped. Only meaningful when `matches` holds.
    pub fn remainder<'a>(&self, path: &'a str) -> &'a str {
        if self.prefix == "/" {
            path
        } else {
            path.get(self.prefix.len()..).unwrap_or("")
        }
    }

    /// Outbound URL for an inbound path and optional query string.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let mut url = format!("{}{}", self.target_base_url, self.remainder(path));
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    pub fn role_allowed(&self, role: &Role) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.contains(role)
    }

    fn normalized(mut self) -> Result<Self, RouteError> {
        if !self.prefix.starts_with('/') {
            return Err(RouteError::InvalidPrefix(self.prefix));
        }
        while self.prefix.len() > 1 && self.prefix.ends_with('/') {
            self.prefix.pop();
        }

        let parsed = url::Url::parse(&self.target_base_url).map_err(|e| {
            RouteError::InvalidTarget {
                prefix: self.prefix.clone(),
                reason: e.to_string(),
            }
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(RouteError::InvalidTarget {
                prefix: self.prefix.clone(),
                reason: "target must be an absolute http(s) URL".to_string(),
            });
        }
        let trimmed = self.target_base_url.trim_end_matches('/').len();
        self.target_base_url.truncate(trimmed);

        Ok(self)
    }
}

/// Prefix table built once at startup and shared read-only afterwards.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<RouteSpec>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(specs: impl IntoIterator<Item = RouteSpec>) -> Result<Self, RouteError> {
        let mut table = Self::new();
        for spec in specs {
            table.register(spec)?;
        }
        Ok(table)
    }

    /// Add a route. Re-registering an identical spec is a no-op; the same
    /// prefix with a different policy is rejected.
    pub fn register(&mut self, spec: RouteSpec) -> Result<(), RouteError> {
        let spec = spec.normalized()?;

        if let Some(existing) = self.routes.iter().find(|r| r.prefix == spec.prefix) {
            if **existing == spec {
                debug!(prefix = %spec.prefix, "Ignoring identical duplicate route");
                return Ok(());
            }
            return Err(RouteError::ConflictingPrefix {
                prefix: spec.prefix,
            });
        }

        debug!(
            prefix = %spec.prefix,
            target = %spec.target_base_url,
            requires_auth = spec.requires_auth,
            rate_class = %spec.rate_class,
            "Registered route"
        );
        self.routes.push(Arc::new(spec));
        Ok(())
    }

    /// Longest matching prefix wins; among equal lengths the first registered wins.
    ///
    /// Paths carrying `.` or `..` segments never resolve: the upstream URL
    /// parser would collapse them after the route policy was chosen.
    pub fn resolve(&self, path: &str) -> Result<Arc<RouteSpec>, RouteError> {
        if has_dot_segment(path) {
            return Err(RouteError::NotFound(path.to_string()));
        }

        let mut best: Option<&Arc<RouteSpec>> = None;
        for route in self.routes.iter().filter(|r| r.matches(path)) {
            match best {
                Some(current) if current.prefix.len() >= route.prefix.len() => {}
                _ => best = Some(route),
            }
        }
        best.cloned()
            .ok_or_else(|| RouteError::NotFound(path.to_string()))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteSpec> {
        self.routes.iter().map(|r| r.as_ref())
    }
}

/// `.` and `..` segments, including their percent-encoded spellings. URL
/// parsers treat `\` as a separator for http(s), so it splits segments too.
fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.replace("%2e", ".").replace("%2E", ".");
        decoded == "." || decoded == ".."
    })
}
