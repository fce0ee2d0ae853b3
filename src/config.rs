//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Credential verification
    pub auth: AuthConfig,
    /// Per-client request throttling
    pub rate_limit: RateLimitConfig,
    /// Downstream health probing
    pub health: HealthConfig,
    /// Upstream retry backoff
    pub retry: RetryConfig,
    /// WebSocket rooms
    pub realtime: RealtimeConfig,
    /// Cross-instance event broker
    pub broker: BrokerConfig,
    /// Cross-origin policy
    pub cors: CorsConfig,
    /// Routes, in priority order for equal-length prefixes
    pub routes: Vec<RouteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            health: HealthConfig::default(),
            retry: RetryConfig::default(),
            realtime: RealtimeConfig::default(),
            broker: BrokerConfig::default(),
            cors: CorsConfig::default(),
            routes: default_routes(),
        }
    }
}

/// The stock service set. Targets come from the environment; an unset
/// variable leaves the route disabled.
fn default_routes() -> Vec<RouteConfig> {
    let route = |service: &str, var: &str, timeout: u64, retries: u32, websocket: bool| {
        let prefix = format!("/api/v1/{service}");
        RouteConfig {
            name: Some(service.to_string()),
            path_rewrite: vec![RewriteRule {
                pattern: format!("^{prefix}"),
                replacement: String::new(),
            }],
            prefix,
            target: Some(format!("${{{var}}}")),
            timeout: Duration::from_secs(timeout),
            max_retries: retries,
            websocket,
        }
    };
    vec![
        route("users", "USERS_SERVICE_URL", 30, 3, false),
        route("auth", "AUTH_SERVICE_URL", 30, 3, false),
        route("messages", "MESSAGES_SERVICE_URL", 60, 2, true),
        route("notifications", "NOTIFICATIONS_SERVICE_URL", 60, 2, true),
    ]
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("EDGE_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must land before ${VAR} expansion reads them
        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string, skipping the environment layer
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed or fails validation.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Self = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.expand_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in targets, secrets and broker URL
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for route in &mut self.routes {
            if let Some(target) = route.target.as_mut() {
                *target = expand_string(&re, target);
            }
        }
        if let Some(secret) = self.auth.jwt_secret.as_mut() {
            *secret = expand_string(&re, secret);
        }
        if let Some(url) = self.broker.redis_url.as_mut() {
            *url = expand_string(&re, url);
        }
    }

    /// Reject configurations the gateway cannot start with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.auth.enabled && self.auth.resolve_secret().is_none() {
            return Err(Error::Config(
                "auth.jwt_secret is required when auth is enabled".to_string(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.max_requests == 0 {
            return Err(Error::Config(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::Config("rate_limit.window must be non-zero".to_string()));
        }
        if self.broker.kind == BrokerKind::Redis
            && self.broker.redis_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(Error::Config(
                "broker.redis_url is required for the redis broker".to_string(),
            ));
        }

        let mut seen: Vec<&str> = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                return Err(Error::Config(format!(
                    "route prefix '{}' must start with '/'",
                    route.prefix
                )));
            }
            let normalized = normalize_prefix(&route.prefix);
            if seen.contains(&normalized) {
                warn!(prefix = %route.prefix, "Duplicate route prefix; the first definition wins");
            } else {
                seen.push(normalized);
            }
        }
        Ok(())
    }
}

/// Strip trailing slashes, keeping `/` itself
#[must_use]
pub fn normalize_prefix(prefix: &str) -> &str {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// How long in-flight work may drain after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Honour `X-Forwarded-For` from a fronting proxy when keying clients
    pub trust_forwarded_for: bool,
    /// Largest request body buffered for retries (bytes)
    pub replay_buffer_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            shutdown_timeout: Duration::from_secs(30),
            trust_forwarded_for: false,
            replay_buffer_limit: 1024 * 1024,
        }
    }
}

/// Credential verification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a bearer credential on non-public paths
    pub enabled: bool,
    /// HMAC secret. Supports a literal value, `env:VAR_NAME` or `${VAR}`.
    pub jwt_secret: Option<String>,
    /// Signing algorithm (HS256, HS384, HS512)
    pub algorithm: String,
    /// Required `iss` claim
    pub issuer: Option<String>,
    /// Required `aud` claim
    pub audience: Option<String>,
    /// Clock skew tolerated on `exp`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Path prefixes that bypass authentication
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    [
        "/api/v1/auth",
        "/healthz",
        "/readyz",
        "/health",
        "/api/v1/health",
        "/metrics",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            jwt_secret: None,
            algorithm: "HS256".to_string(),
            issuer: None,
            audience: None,
            leeway: Duration::ZERO,
            public_paths: default_public_paths(),
        }
    }
}

impl AuthConfig {
    /// Resolve the secret, following `env:VAR_NAME` indirection.
    /// Empty values count as unset.
    #[must_use]
    pub fn resolve_secret(&self) -> Option<String> {
        let raw = self.jwt_secret.as_ref()?;
        let resolved = match raw.strip_prefix("env:") {
            Some(var_name) => env::var(var_name).ok()?,
            None => raw.clone(),
        };
        (!resolved.is_empty()).then_some(resolved)
    }
}

/// Per-client fixed-window throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable throttling
    pub enabled: bool,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests admitted per client per window
    pub max_requests: u32,
    /// Idle age after which a client's counter is dropped (default: 2 x window)
    #[serde(with = "humantime_serde::option")]
    pub evict_after: Option<Duration>,
    /// How often stale counters are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 300,
            evict_after: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Effective eviction age
    #[must_use]
    pub fn evict_after(&self) -> Duration {
        self.evict_after.unwrap_or(self.window * 2)
    }
}

/// Downstream health probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Run the probe loop
    pub enabled: bool,
    /// Time between probe cycles
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-probe deadline
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Path appended to each target
    pub path: String,
    /// Version reported in the gateway block
    pub version: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            path: "/health".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Backoff between upstream attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    /// Growth factor per attempt
    pub multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// WebSocket room settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Accept upgrades on websocket-enabled routes
    pub enabled: bool,
    /// Deadline for the first `auth` frame
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Outbound frames queued per connection
    pub buffer_size: usize,
    /// Inbound frames accepted per connection per second
    pub max_messages_per_second: u32,
    /// Keep-alive ping interval
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Deadline for broker publish/subscribe calls
    #[serde(with = "humantime_serde")]
    pub broker_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            handshake_timeout: Duration::from_secs(10),
            buffer_size: 256,
            max_messages_per_second: 50,
            ping_interval: Duration::from_secs(30),
            broker_timeout: Duration::from_secs(5),
        }
    }
}

/// Broker backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process only; rooms do not span instances
    #[default]
    Memory,
    /// Redis pub/sub
    Redis,
}

/// Cross-instance event broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Backend kind
    pub kind: BrokerKind,
    /// `redis://` URL (supports `${VAR}`)
    pub redis_url: Option<String>,
    /// Prefix for room channel names
    pub channel_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            redis_url: None,
            channel_prefix: "gateway:room:".to_string(),
        }
    }
}

/// Cross-origin policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Origins allowed to call the gateway (`*` allows any, without credentials)
    pub allowed_origins: Vec<String>,
    /// Send `Access-Control-Allow-Credentials`
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            allow_credentials: true,
        }
    }
}

/// One routed service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Service name used in health output (default: last prefix segment)
    #[serde(default)]
    pub name: Option<String>,
    /// Path prefix, matched on segment boundaries
    pub prefix: String,
    /// Target base URL; empty or unset disables the route
    #[serde(default)]
    pub target: Option<String>,
    /// Ordered pattern/replacement rules; the first match is applied
    #[serde(default, with = "rewrite_rules")]
    pub path_rewrite: Vec<RewriteRule>,
    /// Per-attempt upstream deadline
    #[serde(default = "default_route_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Accept WebSocket upgrades on this prefix
    #[serde(default)]
    pub websocket: bool,
}

fn default_route_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

/// Regex pattern and its replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// Regex matched against the request path
    pub pattern: String,
    /// Replacement (supports `$1` capture references)
    #[serde(default)]
    pub replacement: String,
}

/// Accepts either a list of `{pattern, replacement}` rules or a
/// `pattern: replacement` mapping. Only the list form guarantees order once
/// values pass through the environment layer.
mod rewrite_rules {
    use std::fmt;

    use serde::de::{MapAccess, SeqAccess, Visitor};
    use serde::{Deserializer, Serialize, Serializer};

    use super::RewriteRule;

    pub fn serialize<S>(rules: &[RewriteRule], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        rules.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<RewriteRule>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RulesVisitor;

        impl<'de> Visitor<'de> for RulesVisitor {
            type Value = Vec<RewriteRule>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of rewrite rules or a pattern-to-replacement map")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut rules = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(rule) = seq.next_element::<RewriteRule>()? {
                    rules.push(rule);
                }
                Ok(rules)
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut rules = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((pattern, replacement)) = map.next_entry::<String, String>()? {
                    rules.push(RewriteRule {
                        pattern,
                        replacement,
                    });
                }
                Ok(rules)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }
        }

        deserializer.deserialize_any(RulesVisitor)
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string ("30s", or "250ms" for
    /// sub-second values)
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Format a duration the way [`parse_duration`] reads it back
    #[must_use]
    pub fn format_duration(duration: Duration) -> String {
        if duration.subsec_nanos() == 0 {
            format!("{}s", duration.as_secs())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }

    /// Parse "250ms", "30s", "5m", "1h" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns the parse error for the numeric part.
    pub fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }

    /// `Option<Duration>` variant
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&super::format_duration(*d)),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_duration_units() {
        use humantime_serde::parse_duration;
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_format_duration_keeps_millis() {
        use humantime_serde::format_duration;
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
    }

    #[test]
    fn test_default_routes_match_stock_services() {
        let config = Config::default();
        let prefixes: Vec<_> = config.routes.iter().map(|r| r.prefix.as_str()).collect();
        assert_eq!(
            prefixes,
            [
                "/api/v1/users",
                "/api/v1/auth",
                "/api/v1/messages",
                "/api/v1/notifications"
            ]
        );
        assert!(config.routes[2].websocket);
        assert_eq!(config.routes[2].timeout, Duration::from_secs(60));
        assert_eq!(config.routes[0].max_retries, 3);
    }

    #[test]
    fn test_rewrite_rules_from_map_and_list() {
        let yaml = r#"
prefix: /api/v1/users
path_rewrite:
  "^/api/v1/users": ""
"#;
        let route: RouteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(route.path_rewrite.len(), 1);
        assert_eq!(route.path_rewrite[0].pattern, "^/api/v1/users");

        let yaml = r#"
prefix: /api/v1/users
path_rewrite:
  - pattern: "^/api/v1/users/me"
    replacement: "/profile"
  - pattern: "^/api/v1/users"
"#;
        let route: RouteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(route.path_rewrite[0].replacement, "/profile");
        assert_eq!(route.path_rewrite[1].replacement, "");
        assert_eq!(route.timeout, Duration::from_secs(30));
        assert_eq!(route.max_retries, 3);
    }

    #[test]
    fn test_validate_requires_secret_when_auth_enabled() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.auth.jwt_secret = Some("s3cret".to_string());
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.auth.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_prefix() {
        let mut config = Config::default();
        config.auth.enabled = false;
        config.routes[0].prefix = "api/v1/users".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_env_indirection() {
        let auth = AuthConfig {
            jwt_secret: Some("env:EDGE_GW_TEST_SECRET_UNSET".to_string()),
            ..Default::default()
        };
        assert_eq!(auth.resolve_secret(), None);

        let auth = AuthConfig {
            jwt_secret: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(auth.resolve_secret(), None);
    }

    #[test]
    fn test_evict_after_defaults_to_two_windows() {
        let limits = RateLimitConfig::default();
        assert_eq!(limits.evict_after(), Duration::from_secs(120));
    }

    #[test]
    fn test_env_files_expand_into_targets() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("gateway.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "EDGE_GW_TEST_USERS_URL=http://users.internal:8080").unwrap();
        drop(f);

        let mut config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            routes: vec![RouteConfig {
                name: None,
                prefix: "/api/v1/users".to_string(),
                target: Some("${EDGE_GW_TEST_USERS_URL}".to_string()),
                path_rewrite: Vec::new(),
                timeout: default_route_timeout(),
                max_retries: 3,
                websocket: false,
            }],
            ..Default::default()
        };
        config.load_env_files();
        config.expand_env_vars();
        assert_eq!(
            config.routes[0].target.as_deref(),
            Some("http://users.internal:8080")
        );
    }

    #[test]
    fn test_missing_variable_uses_default() {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap();
        assert_eq!(
            expand_string(&re, "${EDGE_GW_TEST_NEVER_SET:-http://fallback:1}"),
            "http://fallback:1"
        );
        assert_eq!(expand_string(&re, "${EDGE_GW_TEST_NEVER_SET}"), "");
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("/api/v1/users/"), "/api/v1/users");
        assert_eq!(normalize_prefix("/"), "/");
        assert_eq!(normalize_prefix("//"), "/");
    }
}
