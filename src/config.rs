//! Startup configuration, loaded once from the environment.
//!
//! Protocol constants (retry counts, backoff bounds, barrier timeouts) are
//! NOT configurable here — spec treats them as fixed behavior, not deployment
//! knobs. See `retry.rs` and `accept.rs` for those.

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            other => Err(OrchestratorError::config(format!(
                "APP_ENV must be 'development' or 'production', got '{other}'"
            ))),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CarrierConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub api_key: String,
    pub project_id: String,
    pub webhook_secret: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub domain: String,
    pub environment: Environment,
    pub bind_addr: String,
    pub database_url: String,
    pub carrier: CarrierConfig,
    pub realtime: RealtimeConfig,
    pub human_agent_e164: String,
    pub phi_redaction: bool,
    pub realtime_unit_rate_cents_per_min: f64,
}

impl Config {
    /// Load and validate configuration from the process environment.
    ///
    /// Collects every missing/invalid variable into one error rather than
    /// failing on the first, so operators see the whole list at once.
    pub fn from_env() -> Result<Self> {
        let mut missing = Vec::new();

        let domain = required("DOMAIN", &mut missing);
        let app_env = required("APP_ENV", &mut missing);
        let account_sid = required("CARRIER_ACCOUNT_SID", &mut missing);
        let auth_token = required("CARRIER_AUTH_TOKEN", &mut missing);
        let carrier_base_url = required("CARRIER_BASE_URL", &mut missing);
        let realtime_api_key = required("REALTIME_API_KEY", &mut missing);
        let realtime_project_id = required("REALTIME_PROJECT_ID", &mut missing);
        let realtime_webhook_secret = required("REALTIME_WEBHOOK_SECRET", &mut missing);
        let realtime_base_url = required("REALTIME_BASE_URL", &mut missing);
        let human_agent_e164 = required("HUMAN_AGENT_E164", &mut missing);

        if !missing.is_empty() {
            return Err(OrchestratorError::config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        let environment = Environment::parse(&app_env)?;

        if !realtime_webhook_secret.starts_with("whsec_") {
            return Err(OrchestratorError::config(
                "REALTIME_WEBHOOK_SECRET must be prefixed 'whsec_'",
            ));
        }

        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:nightline.db".to_string());

        let phi_redaction = std::env::var("PHI_REDACTION")
            .map(|v| v != "0")
            .unwrap_or(environment == Environment::Production);

        let realtime_unit_rate_cents_per_min = std::env::var("REALTIME_UNIT_RATE_CENTS_PER_MIN")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(19.0);

        Ok(Config {
            domain,
            environment,
            bind_addr,
            database_url,
            carrier: CarrierConfig {
                account_sid,
                auth_token,
                base_url: carrier_base_url,
            },
            realtime: RealtimeConfig {
                api_key: realtime_api_key,
                project_id: realtime_project_id,
                webhook_secret: realtime_webhook_secret,
                base_url: realtime_base_url,
            },
            human_agent_e164,
            phi_redaction,
            realtime_unit_rate_cents_per_min,
        })
    }
}

fn required(key: &str, missing: &mut Vec<String>) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => {
            missing.push(key.to_string());
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_all_required() {
        std::env::set_var("DOMAIN", "after-hours.example.com");
        std::env::set_var("APP_ENV", "development");
        std::env::set_var("CARRIER_ACCOUNT_SID", "ACxxx");
        std::env::set_var("CARRIER_AUTH_TOKEN", "tok");
        std::env::set_var("CARRIER_BASE_URL", "https://carrier.example.com");
        std::env::set_var("REALTIME_API_KEY", "key");
        std::env::set_var("REALTIME_PROJECT_ID", "proj");
        std::env::set_var("REALTIME_WEBHOOK_SECRET", "whsec_abc");
        std::env::set_var("REALTIME_BASE_URL", "https://realtime.example.com");
        std::env::set_var("HUMAN_AGENT_E164", "+19095550000");
    }

    #[test]
    #[serial]
    fn loads_with_all_required_vars_present() {
        set_all_required();
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.domain, "after-hours.example.com");
        assert_eq!(cfg.environment, Environment::Development);
        assert!(!cfg.phi_redaction);
    }

    #[test]
    #[serial]
    fn rejects_missing_variables() {
        set_all_required();
        std::env::remove_var("CARRIER_AUTH_TOKEN");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("CARRIER_AUTH_TOKEN"));
        std::env::set_var("CARRIER_AUTH_TOKEN", "tok");
    }

    #[test]
    #[serial]
    fn rejects_webhook_secret_without_prefix() {
        set_all_required();
        std::env::set_var("REALTIME_WEBHOOK_SECRET", "not-prefixed");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("whsec_"));
        std::env::set_var("REALTIME_WEBHOOK_SECRET", "whsec_abc");
    }
}
