//! Configuration management
//!
//! Settings come from an optional TOML file, overridden by `YAKUA__`
//! environment variables (`YAKUA__KEEP_ALIVE__INTERVAL=15`).

use crate::domain::shared::{DomainError, SipAddress};
use crate::domain::subscription::EventPackage;
use crate::infrastructure::protocols::sip::auth::UserCredentials;
use crate::infrastructure::protocols::sip::subscription::SubscriptionConfig;
use crate::infrastructure::protocols::sip::watchdog::{KeepAliveMethod, WatchdogConfig};
use config::{ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

const ENV_PREFIX: &str = "YAKUA";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub subscription: SubscriptionSettings,
    pub keep_alive: KeepAliveConfig,
    pub sip: SipConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Address of record, `sip:user@domain`
    pub aor: String,
    pub display_name: Option<String>,
    /// `host:port` of the registrar; None for registrar-less accounts
    pub registrar: Option<String>,
    /// SIP URI of the outbound proxy
    pub outbound_proxy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Presence subscriptions made at startup
    pub presence_targets: Vec<String>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            aor: "sip:user@localhost".to_string(),
            display_name: None,
            registrar: None,
            outbound_proxy: None,
            username: None,
            password: None,
            presence_targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Requested subscription duration in seconds
    pub duration: u32,
    /// Seconds before expiry at which subscriptions are refreshed
    pub refresh_margin: u32,
    /// Event packages to run engines for
    pub packages: Vec<String>,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            duration: 3600,
            refresh_margin: 60,
            packages: vec![
                EventPackage::PRESENCE.name.to_string(),
                EventPackage::DIALOG.name.to_string(),
                EventPackage::MESSAGE_SUMMARY.name.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    pub method: KeepAliveMethod,
    /// Seconds between probes, 0 disables
    pub interval: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            method: KeepAliveMethod::Options,
            interval: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub user_agent: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5060".to_string(),
            user_agent: format!("yakua/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from `path` (if given and present) and the environment
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse TOML text, without environment overrides
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn account_address(&self) -> Result<SipAddress, DomainError> {
        match &self.account.display_name {
            Some(name) => SipAddress::parse(&format!("\"{}\" <{}>", name, self.account.aor)),
            None => SipAddress::parse(&self.account.aor),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, DomainError> {
        self.sip.bind_address.parse().map_err(|_| {
            DomainError::ValidationError(format!("Invalid bind address: {}", self.sip.bind_address))
        })
    }

    pub fn registrar_addr(&self) -> Result<Option<SocketAddr>, DomainError> {
        self.account
            .registrar
            .as_deref()
            .map(|r| {
                r.parse().map_err(|_| {
                    DomainError::ValidationError(format!("Invalid registrar address: {}", r))
                })
            })
            .transpose()
    }

    /// Enabled event packages; unknown names are skipped
    pub fn event_packages(&self) -> Vec<EventPackage> {
        self.subscription
            .packages
            .iter()
            .filter_map(|name| {
                let package = EventPackage::by_name(name);
                if package.is_none() {
                    warn!("Unknown event package {} in configuration", name);
                }
                package
            })
            .collect()
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            duration: self.subscription.duration,
            refresh_margin: self.subscription.refresh_margin,
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            method: self.keep_alive.method,
            interval: Duration::from_secs(self.keep_alive.interval),
            has_registrar: self.account.registrar.is_some(),
        }
    }

    pub fn credentials(&self) -> Option<UserCredentials> {
        match (&self.account.username, &self.account.password) {
            (Some(username), Some(password)) => Some(UserCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.subscription.duration, 3600);
        assert_eq!(config.subscription.refresh_margin, 60);
        assert_eq!(config.keep_alive.interval, 25);
        assert_eq!(config.keep_alive.method, KeepAliveMethod::Options);
        assert_eq!(config.event_packages().len(), 3);
        assert!(!config.watchdog_config().has_registrar);
        assert!(config.credentials().is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [account]
            aor = "sip:alice@example.com"
            display_name = "Alice"
            registrar = "192.0.2.10:5060"
            username = "alice"
            password = "secret"

            [keep_alive]
            method = "crlf"
            interval = 15

            [subscription]
            packages = ["presence", "bogus"]
            "#,
        )
        .unwrap();

        assert_eq!(config.keep_alive.method, KeepAliveMethod::Crlf);
        assert_eq!(config.watchdog_config().interval, Duration::from_secs(15));
        assert!(config.watchdog_config().has_registrar);
        assert_eq!(config.subscription.duration, 3600);
        assert_eq!(config.event_packages(), vec![EventPackage::PRESENCE]);
        assert_eq!(config.account_address().unwrap().display_name(), Some("Alice"));
        assert_eq!(
            config.registrar_addr().unwrap(),
            Some("192.0.2.10:5060".parse().unwrap())
        );
        assert_eq!(config.credentials().unwrap().username, "alice");
    }

    #[test]
    fn test_rendered_config_loads_back() {
        let mut config = Config::default();
        config.account.presence_targets = vec!["sip:bob@example.com".to_string()];
        let text = config.to_toml().unwrap();
        assert!(text.contains("[keep_alive]"));
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        let mut config = Config::default();
        config.sip.bind_address = "not an address".to_string();
        config.account.registrar = Some("registrar".to_string());
        assert!(config.bind_addr().is_err());
        assert!(config.registrar_addr().is_err());
    }
}
