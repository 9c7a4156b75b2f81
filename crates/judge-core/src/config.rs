//! Service configuration from `JUDGE_*` environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `JUDGE_BIND` | `127.0.0.1:8080` |
//! | `JUDGE_METRICS_WINDOW_SEC` | `300` |
//! | `JUDGE_CLOCK_SKEW_SEC` | `90` |
//! | `JUDGE_REPLAY_BACKEND` | `embedded` (`memory`, `shared`) |
//! | `JUDGE_REPLAY_PATH` | `var/judge/replay` |
//! | `JUDGE_REPLAY_TTL_SEC` / `_SKEW_SEC` / `_PURGE_INTERVAL_SEC` | `600` / `120` / `60` |
//! | `JUDGE_REPLAY_URL`, `_USERNAME`, `_PASSWORD`, `_NAMESPACE`, `_DATABASE`, `_ROOT` | shared backend only |
//! | `JUDGE_KEYS_URL`, `JUDGE_KEYS_URL_TIMEOUT_MS` | unset, `2000` |
//! | `JUDGE_KEYS_FILE` | unset |
//! | `JUDGE_KEYS` (JSON or `id:secret,...`), `JUDGE_HMAC_SECRET` (legacy) | read at refresh time |
//! | `JUDGE_KEY_REFRESH_SEC` / `JUDGE_KEY_GRACE_SEC` / `JUDGE_KEY_STALE_ALLOWANCE_SEC` | `300` / `60` / `0` |
//! | `JUDGE_ALLOWED_KEY_IDS` | unset (allow every authenticated key) |
//! | `JUDGE_REQUIRE_SIGNED_NONCE` | `false` (body must carry the header nonce when `true`) |
//! | `JUDGE_LOG_FORMAT` / `JUDGE_LOG_LEVEL` | `text` / `info` |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use judge_state::{ReplayBackendConfig, StorageError};

use crate::authz::{AllowAll, Authorizer, StaticAllowList};
use crate::clock::Clock;
use crate::keys::{KeySources, KeyStore, KeyStoreConfig};
use crate::metrics::{Counters, SlidingWindow};
use crate::replay::{ReplayGuard, ReplayGuardConfig};
use crate::service::{JudgeService, DEFAULT_CLOCK_SKEW_SEC};

/// Environment variable holding the key document.
pub const KEYS_ENV_VAR: &str = "JUDGE_KEYS";
/// Legacy single-secret variable.
pub const LEGACY_SECRET_VAR: &str = "JUDGE_HMAC_SECRET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {detail}")]
    Invalid {
        var: &'static str,
        value: String,
        detail: String,
    },

    #[error("replay backend: {0}")]
    Storage(#[from] StorageError),
}

/// Everything needed to assemble a [`JudgeService`].
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub bind: SocketAddr,
    pub metrics_window_sec: u64,
    pub clock_skew_sec: f64,
    pub replay_backend: String,
    pub replay_path: PathBuf,
    pub replay: ReplayGuardConfig,
    pub keys_url: Option<String>,
    pub keys_url_timeout: Duration,
    pub keys_file: Option<PathBuf>,
    pub keys: KeyStoreConfig,
    pub allowed_key_ids: Option<Vec<String>>,
    pub require_signed_nonce: bool,
    pub log_json: bool,
    pub log_level: String,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            metrics_window_sec: 300,
            clock_skew_sec: DEFAULT_CLOCK_SKEW_SEC,
            replay_backend: "embedded".to_string(),
            replay_path: PathBuf::from("var/judge/replay"),
            replay: ReplayGuardConfig::default(),
            keys_url: None,
            keys_url_timeout: Duration::from_millis(2000),
            keys_file: None,
            keys: KeyStoreConfig::default(),
            allowed_key_ids: None,
            require_signed_nonce: false,
            log_json: false,
            log_level: "info".to_string(),
        }
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        detail: e.to_string(),
    })
}

fn non_negative(var: &'static str, value: i64) -> Result<i64, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            detail: "must not be negative".to_string(),
        });
    }
    Ok(value)
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            detail: "expected true or false".to_string(),
        }),
    }
}

impl JudgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(v) = get("JUDGE_BIND") {
            cfg.bind = parse("JUDGE_BIND", &v)?;
        }
        if let Some(v) = get("JUDGE_METRICS_WINDOW_SEC") {
            cfg.metrics_window_sec = parse("JUDGE_METRICS_WINDOW_SEC", &v)?;
        }
        if let Some(v) = get("JUDGE_CLOCK_SKEW_SEC") {
            cfg.clock_skew_sec = parse("JUDGE_CLOCK_SKEW_SEC", &v)?;
        }
        if let Some(v) = get("JUDGE_REPLAY_BACKEND") {
            cfg.replay_backend = v.trim().to_string();
        }
        if let Some(v) = get("JUDGE_REPLAY_PATH") {
            cfg.replay_path = PathBuf::from(v);
        }
        if let Some(v) = get("JUDGE_REPLAY_TTL_SEC") {
            cfg.replay.ttl_sec = non_negative("JUDGE_REPLAY_TTL_SEC", parse("JUDGE_REPLAY_TTL_SEC", &v)?)?;
        }
        if let Some(v) = get("JUDGE_REPLAY_SKEW_SEC") {
            cfg.replay.skew_sec =
                non_negative("JUDGE_REPLAY_SKEW_SEC", parse("JUDGE_REPLAY_SKEW_SEC", &v)?)?;
        }
        if let Some(v) = get("JUDGE_REPLAY_PURGE_INTERVAL_SEC") {
            cfg.replay.purge_interval_sec = non_negative(
                "JUDGE_REPLAY_PURGE_INTERVAL_SEC",
                parse("JUDGE_REPLAY_PURGE_INTERVAL_SEC", &v)?,
            )?;
        }
        cfg.keys_url = get("JUDGE_KEYS_URL");
        if let Some(v) = get("JUDGE_KEYS_URL_TIMEOUT_MS") {
            cfg.keys_url_timeout =
                Duration::from_millis(parse("JUDGE_KEYS_URL_TIMEOUT_MS", &v)?);
        }
        cfg.keys_file = get("JUDGE_KEYS_FILE").map(PathBuf::from);
        if let Some(v) = get("JUDGE_KEY_REFRESH_SEC") {
            cfg.keys.refresh_interval = Duration::from_secs(parse("JUDGE_KEY_REFRESH_SEC", &v)?);
        }
        if let Some(v) = get("JUDGE_KEY_GRACE_SEC") {
            cfg.keys.grace_window_sec =
                non_negative("JUDGE_KEY_GRACE_SEC", parse("JUDGE_KEY_GRACE_SEC", &v)?)?;
        }
        if let Some(v) = get("JUDGE_KEY_STALE_ALLOWANCE_SEC") {
            cfg.keys.stale_allowance_sec = non_negative(
                "JUDGE_KEY_STALE_ALLOWANCE_SEC",
                parse("JUDGE_KEY_STALE_ALLOWANCE_SEC", &v)?,
            )?;
        }
        cfg.allowed_key_ids = get("JUDGE_ALLOWED_KEY_IDS").map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        });
        if let Some(v) = get("JUDGE_REQUIRE_SIGNED_NONCE") {
            cfg.require_signed_nonce = parse_flag("JUDGE_REQUIRE_SIGNED_NONCE", &v)?;
        }
        if let Some(v) = get("JUDGE_LOG_FORMAT") {
            cfg.log_json = match v.trim().to_ascii_lowercase().as_str() {
                "json" => true,
                "text" | "pretty" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "JUDGE_LOG_FORMAT",
                        value: v,
                        detail: "expected text or json".to_string(),
                    })
                }
            };
        }
        if let Some(v) = get("JUDGE_LOG_LEVEL") {
            cfg.log_level = v.trim().to_string();
        }

        Ok(cfg)
    }

    /// Key sources in priority order: remote, file, environment.
    pub fn key_sources(&self) -> KeySources {
        let mut sources = KeySources::new().with_env(KEYS_ENV_VAR, Some(LEGACY_SECRET_VAR.to_string()));
        if let Some(path) = &self.keys_file {
            sources = sources.with_file(path.clone());
        }
        if let Some(url) = &self.keys_url {
            sources = sources.with_remote(url.clone(), self.keys_url_timeout);
        }
        sources
    }

    pub fn replay_backend_config(&self) -> Result<ReplayBackendConfig, ConfigError> {
        Ok(ReplayBackendConfig::from_name(
            &self.replay_backend,
            self.replay_path.clone(),
        )?)
    }

    pub fn authorizer(&self) -> Arc<dyn Authorizer> {
        match &self.allowed_key_ids {
            Some(ids) => Arc::new(StaticAllowList::new(ids.iter().cloned())),
            None => Arc::new(AllowAll),
        }
    }

    /// Open the replay backend and assemble the service. Keys are not loaded
    /// yet; call [`KeyStore::refresh`] before serving.
    pub async fn build_service(&self, clock: Arc<dyn Clock>) -> Result<JudgeService, ConfigError> {
        let store = self.replay_backend_config()?.open().await?;
        let counters = Arc::new(Counters::new());
        let keys = Arc::new(KeyStore::new(
            self.key_sources(),
            self.keys.clone(),
            Arc::clone(&clock),
        ));
        let replay = Arc::new(ReplayGuard::new(
            store,
            self.replay,
            Arc::clone(&clock),
            Arc::clone(&counters),
        ));
        let window = Arc::new(SlidingWindow::new(self.metrics_window_sec, Arc::clone(&clock)));

        Ok(JudgeService::new(keys, replay, counters, clock)
            .with_window(window)
            .with_authorizer(self.authorizer())
            .with_clock_skew(self.clock_skew_sec)
            .with_signed_nonce_required(self.require_signed_nonce))
    }
}
