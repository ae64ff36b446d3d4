//! Gateway configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Every field has a default, so an empty file (or no file at all) yields a
//! runnable development config.
//!
//! # Optional sections
//! - `[rate_limit]` -- absent means no rate limiting
//! - `[auth]` with `required = true` turns on the login requirement
//!
//! # Secret file format
//! Raw secret string on a single line; trimmed on read.

use gate_core::permissions::RolePermission;
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub heartbeat: HeartbeatConfig,
    pub limits: LimitsConfig,
    pub rate_limit: Option<RateLimitConfig>,
    pub permissions: PermissionsConfig,
    pub audit: AuditConfig,
    pub errors: ErrorsConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub ws_path: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub required: bool,
    pub session_ttl_ms: Option<i64>,
    /// Bootstrap secret for `identity.loginWithSecret` (already resolved
    /// from the file when `superadmin_secret_file` was configured).
    pub superadmin_secret: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// Informational; the effective grace is exactly one interval.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitsConfig {
    pub max_subscriptions_per_connection: usize,
    pub max_buffered_bytes: usize,
    /// Fraction of `max_buffered_bytes` above which pushes are dropped.
    pub high_water_mark: f64,
}

impl LimitsConfig {
    /// Byte threshold above which push frames are dropped.
    pub fn backpressure_threshold(&self) -> usize {
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let threshold = (self.max_buffered_bytes as f64 * self.high_water_mark) as usize;
        threshold
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PermissionsConfig {
    pub default_allow: bool,
    pub roles: Vec<RolePermission>,
}

#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorsConfig {
    pub expose_details: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    pub grace_period_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            schema_version: 1,
            server: ServerConfig {
                bind: "0.0.0.0:9090".to_owned(),
                ws_path: "/ws".to_owned(),
            },
            auth: AuthConfig {
                required: false,
                session_ttl_ms: Some(3_600_000),
                superadmin_secret: None,
            },
            heartbeat: HeartbeatConfig {
                interval_ms: 30_000,
                timeout_ms: 60_000,
            },
            limits: LimitsConfig {
                max_subscriptions_per_connection: 100,
                max_buffered_bytes: 1_048_576,
                high_water_mark: 0.9,
            },
            rate_limit: None,
            permissions: PermissionsConfig {
                default_allow: true,
                roles: Vec::new(),
            },
            audit: AuditConfig { capacity: 10_000 },
            errors: ErrorsConfig {
                expose_details: false,
            },
            shutdown: ShutdownConfig {
                grace_period_ms: 5_000,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    limits: Option<RawLimitsConfig>,
    rate_limit: Option<RawRateLimitConfig>,
    permissions: Option<RawPermissionsConfig>,
    audit: Option<RawAuditConfig>,
    errors: Option<RawErrorsConfig>,
    shutdown: Option<RawShutdownConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
    ws_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    required: Option<bool>,
    session_ttl_ms: Option<i64>,
    superadmin_secret: Option<String>,
    superadmin_secret_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawLimitsConfig {
    max_subscriptions_per_connection: Option<usize>,
    max_buffered_bytes: Option<usize>,
    high_water_mark: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawRateLimitConfig {
    max_requests: Option<u32>,
    window_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPermissionsConfig {
    default: Option<String>,
    #[serde(default)]
    roles: Vec<RolePermission>,
}

#[derive(Debug, Deserialize)]
struct RawAuditConfig {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawErrorsConfig {
    expose_details: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawShutdownConfig {
    grace_period_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported schema_version {0} (expected 1)")]
    SchemaVersion(u32),
    #[error("failed to read secret file {path}: {source}")]
    SecretFile {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
    #[error("[permissions] default must be \"allow\" or \"deny\", got {0:?}")]
    PermissionDefault(String),
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<GatewayConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        GatewayConfig::parse(&text)
    }

    pub fn parse(text: &str) -> Result<GatewayConfig, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let defaults = GatewayConfig::default();

        let schema_version = raw.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(ConfigError::SchemaVersion(schema_version));
        }

        let server = match raw.server {
            Some(s) => ServerConfig {
                bind: s.bind.unwrap_or(defaults.server.bind),
                ws_path: s.ws_path.unwrap_or(defaults.server.ws_path),
            },
            None => defaults.server,
        };

        let auth = match raw.auth {
            Some(a) => {
                let superadmin_secret = match (a.superadmin_secret, a.superadmin_secret_file) {
                    (Some(secret), _) => Some(secret),
                    (None, Some(file)) => Some(
                        std::fs::read_to_string(&file)
                            .map_err(|source| ConfigError::SecretFile { path: file, source })?
                            .trim()
                            .to_owned(),
                    ),
                    (None, None) => None,
                };
                AuthConfig {
                    required: a.required.unwrap_or(defaults.auth.required),
                    session_ttl_ms: a.session_ttl_ms.or(defaults.auth.session_ttl_ms),
                    superadmin_secret,
                }
            }
            None => defaults.auth,
        };

        let heartbeat = match raw.heartbeat {
            Some(h) => {
                let interval_ms = h.interval_ms.unwrap_or(defaults.heartbeat.interval_ms);
                if interval_ms == 0 {
                    return Err(ConfigError::Invalid {
                        field: "heartbeat.interval_ms",
                        reason: "must be greater than zero".to_owned(),
                    });
                }
                HeartbeatConfig {
                    interval_ms,
                    timeout_ms: h.timeout_ms.unwrap_or(interval_ms * 2),
                }
            }
            None => defaults.heartbeat,
        };

        let limits = match raw.limits {
            Some(l) => {
                let high_water_mark = l.high_water_mark.unwrap_or(defaults.limits.high_water_mark);
                if !(0.0..=1.0).contains(&high_water_mark) {
                    return Err(ConfigError::Invalid {
                        field: "limits.high_water_mark",
                        reason: format!("must be within 0.0..=1.0, got {high_water_mark}"),
                    });
                }
                LimitsConfig {
                    max_subscriptions_per_connection: l
                        .max_subscriptions_per_connection
                        .unwrap_or(defaults.limits.max_subscriptions_per_connection),
                    max_buffered_bytes: l
                        .max_buffered_bytes
                        .unwrap_or(defaults.limits.max_buffered_bytes),
                    high_water_mark,
                }
            }
            None => defaults.limits,
        };

        let rate_limit = match raw.rate_limit {
            Some(r) => Some(RateLimitConfig {
                max_requests: r.max_requests.unwrap_or(100),
                window_ms: r.window_ms.unwrap_or(60_000).max(1),
            }),
            None => None,
        };

        let permissions = match raw.permissions {
            Some(p) => {
                let default_allow = match p.default.as_deref() {
                    None | Some("allow") => true,
                    Some("deny") => false,
                    Some(other) => {
                        return Err(ConfigError::PermissionDefault(other.to_owned()));
                    }
                };
                PermissionsConfig {
                    default_allow,
                    roles: p.roles,
                }
            }
            None => defaults.permissions,
        };

        let audit = match raw.audit {
            Some(a) => AuditConfig {
                capacity: a.capacity.unwrap_or(defaults.audit.capacity).max(1),
            },
            None => defaults.audit,
        };

        let errors = match raw.errors {
            Some(e) => ErrorsConfig {
                expose_details: e.expose_details.unwrap_or(defaults.errors.expose_details),
            },
            None => defaults.errors,
        };

        let shutdown = match raw.shutdown {
            Some(s) => ShutdownConfig {
                grace_period_ms: s
                    .grace_period_ms
                    .unwrap_or(defaults.shutdown.grace_period_ms),
            },
            None => defaults.shutdown,
        };

        Ok(GatewayConfig {
            schema_version,
            server,
            auth,
            heartbeat,
            limits,
            rate_limit,
            permissions,
            audit,
            errors,
            shutdown,
        })
    }
}
