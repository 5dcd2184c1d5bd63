use serde::Deserialize;
use service_core::config::{self as core_config, get_env, get_env_parsed, get_optional_env};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

pub use core_config::Environment;

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub identity: IdentityConfig,
    pub membership_cache: MembershipCacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout_ms: u64,
}

impl IdentityConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipCacheConfig {
    pub ttl_seconds: u64,
    /// Upper bound on one upstream lookup, including queueing behind a
    /// coalesced request for the same subject.
    pub lookup_timeout_ms: u64,
}

impl MembershipCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl Default for MembershipCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            lookup_timeout_ms: 5_000,
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = RegistryConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("sensor-registry"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: get_optional_env("OTLP_ENDPOINT"),
            identity: IdentityConfig {
                base_url: get_env("IDENTITY_SERVICE_URL", None, is_prod)?,
                api_token: get_optional_env("IDENTITY_SERVICE_TOKEN"),
                request_timeout_ms: get_env_parsed(
                    "IDENTITY_REQUEST_TIMEOUT_MS",
                    Some("3000"),
                    is_prod,
                )?,
            },
            membership_cache: MembershipCacheConfig {
                ttl_seconds: get_env_parsed("MEMBERSHIP_CACHE_TTL_SECONDS", Some("300"), is_prod)?,
                lookup_timeout_ms: get_env_parsed(
                    "MEMBERSHIP_LOOKUP_TIMEOUT_MS",
                    Some("5000"),
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.identity.base_url.trim().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IDENTITY_SERVICE_URL must not be empty"
            )));
        }

        if self.identity.request_timeout_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IDENTITY_REQUEST_TIMEOUT_MS must be positive"
            )));
        }

        if self.membership_cache.lookup_timeout_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MEMBERSHIP_LOOKUP_TIMEOUT_MS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.identity.api_token.is_none() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "IDENTITY_SERVICE_TOKEN is required in production"
                )));
            }

            if !self.identity.base_url.starts_with("https://") {
                tracing::error!("Identity service is not reached over https in production");
            }
        }

        Ok(())
    }
}
