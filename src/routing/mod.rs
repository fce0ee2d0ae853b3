//! Route table: path prefix to target service
//!
//! Built once at startup and shared read-only behind an `Arc`. Resolution is
//! longest-prefix-first on path-segment boundaries, with configuration order
//! breaking ties between equal prefixes.

mod rewrite;

pub use rewrite::PathRewrite;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::config::{RouteConfig, normalize_prefix};
use crate::{Error, Result};

/// A resolved service descriptor
#[derive(Debug, Clone)]
pub struct Route {
    name: String,
    prefix: String,
    target: Option<Url>,
    rewrite: PathRewrite,
    timeout: Duration,
    max_retries: u32,
    websocket: bool,
}

impl Route {
    /// Build a route from its configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a non-http(s) target or a bad rewrite pattern.
    pub fn from_config(config: &RouteConfig) -> Result<Self> {
        let prefix = normalize_prefix(config.prefix.trim()).to_string();
        if !prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "route prefix '{}' must start with '/'",
                config.prefix
            )));
        }

        let target = match config.target.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let url = Url::parse(raw)
                    .map_err(|e| Error::Config(format!("invalid target '{raw}' for {prefix}: {e}")))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::Config(format!(
                        "target '{raw}' for {prefix} must be http or https"
                    )));
                }
                Some(url)
            }
        };

        let name = config
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| derive_name(&prefix));

        Ok(Self {
            name,
            rewrite: PathRewrite::compile(&config.path_rewrite)?,
            prefix,
            target,
            timeout: config.timeout,
            max_retries: config.max_retries,
            websocket: config.websocket,
        })
    }

    /// Service name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Target base URL, `None` when the route is disabled
    #[must_use]
    pub fn target(&self) -> Option<&Url> {
        self.target.as_ref()
    }

    /// Whether a target is configured
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.target.is_some()
    }

    /// Per-attempt deadline
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Retries after the first attempt
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether WebSocket upgrades are accepted
    #[must_use]
    pub fn websocket_enabled(&self) -> bool {
        self.websocket
    }

    /// Whether this route's prefix covers `path`
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        path_has_prefix(path, &self.prefix)
    }

    /// Apply the rewrite rules to a request path
    #[must_use]
    pub fn rewrite_path(&self, path: &str) -> String {
        self.rewrite.apply(path)
    }

    /// Upstream URL for a request: target base path joined with the
    /// rewritten path, query preserved. `None` for a disabled route.
    #[must_use]
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Option<Url> {
        let target = self.target.as_ref()?;
        let mut url = target.clone();
        let rewritten = self.rewrite_path(path);
        let base = target.path().trim_end_matches('/');
        if base.is_empty() {
            url.set_path(&rewritten);
        } else if rewritten == "/" {
            url.set_path(base);
        } else {
            url.set_path(&format!("{base}{rewritten}"));
        }
        url.set_query(query.filter(|q| !q.is_empty()));
        Some(url)
    }

    /// Health endpoint for this route's target
    #[must_use]
    pub fn health_url(&self, health_path: &str) -> Option<Url> {
        let target = self.target.as_ref()?;
        let mut url = target.clone();
        let base = target.path().trim_end_matches('/');
        let suffix = if health_path.starts_with('/') {
            health_path.to_string()
        } else {
            format!("/{health_path}")
        };
        url.set_path(&format!("{base}{suffix}"));
        url.set_query(None);
        Some(url)
    }
}

/// Last non-empty path segment, or `root` for `/`
fn derive_name(prefix: &str) -> String {
    prefix
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("root")
        .to_string()
}

/// Segment-boundary prefix test: `/a/b` covers `/a/b` and `/a/b/c` but not
/// `/a/bc`. `/` covers every path.
#[must_use]
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = normalize_prefix(prefix);
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Immutable prefix-to-route mapping
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    /// Configuration order, used for iteration and tie-breaks
    routes: Vec<Arc<Route>>,
    /// Indices into `routes`, longest prefix first (stable)
    by_length: Vec<usize>,
}

impl RouteTable {
    /// Build the table from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if any route is invalid.
    pub fn new(configs: &[RouteConfig]) -> Result<Self> {
        let routes = configs
            .iter()
            .map(|c| Route::from_config(c).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let mut by_length: Vec<usize> = (0..routes.len()).collect();
        // sort_by_key is stable, so equal prefixes keep configuration order
        by_length.sort_by_key(|&i| std::cmp::Reverse(routes[i].prefix.len()));

        Ok(Self { routes, by_length })
    }

    /// Longest matching route for `path`
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Arc<Route>> {
        let route = self
            .by_length
            .iter()
            .map(|&i| &self.routes[i])
            .find(|route| route.matches(path))
            .cloned();
        debug!(path = %path, route = ?route.as_ref().map(|r| r.name()), "Route lookup");
        route
    }

    /// Routes in configuration order
    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.iter()
    }

    /// Number of routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
