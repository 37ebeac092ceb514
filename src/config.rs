// ABOUTME: Command line options and the typed settings the bridge is started from
// ABOUTME: Defaults match the broker layout applications already publish to (richmond exchange, ssmi.* keys)

use crate::bridge::RetryPolicy;
use crate::ssmi::KeepAliveConfig;
use argh::FromArgs;
use std::time::Duration;
use thiserror::Error;

/// Bridge an AMQP broker to an SSMI USSD/SMS gateway
#[derive(Debug, FromArgs)]
pub struct Options {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    pub debug: bool,

    /// SSMI username
    #[argh(option)]
    pub ssmi_username: Option<String>,

    /// SSMI password
    #[argh(option)]
    pub ssmi_password: Option<String>,

    /// SSMI host
    #[argh(option)]
    pub ssmi_host: Option<String>,

    /// SSMI host's port
    #[argh(option)]
    pub ssmi_port: Option<u16>,

    /// seconds between SSMI link checks, 0 disables them (default: 60)
    #[argh(option, default = "60")]
    pub keep_alive_interval: u64,

    /// AMQP host (default: localhost)
    #[argh(option, default = "String::from(\"localhost\")")]
    pub amqp_host: String,

    /// AMQP port (default: 5672)
    #[argh(option, default = "5672")]
    pub amqp_port: u16,

    /// AMQP username (default: richmond)
    #[argh(option, default = "String::from(\"richmond\")")]
    pub amqp_username: String,

    /// AMQP password (default: richmond)
    #[argh(option, default = "String::from(\"richmond\")")]
    pub amqp_password: String,

    /// AMQP virtual host (default: /richmond)
    #[argh(option, default = "String::from(\"/richmond\")")]
    pub amqp_vhost: String,

    /// AMQP send queue (default: richmond.send)
    #[argh(option, default = "String::from(\"richmond.send\")")]
    pub amqp_send_queue: String,

    /// AMQP routing key for the send queue (default: ssmi.send)
    #[argh(option, default = "String::from(\"ssmi.send\")")]
    pub amqp_send_routing_key: String,

    /// AMQP exchange (default: richmond)
    #[argh(option, default = "String::from(\"richmond\")")]
    pub amqp_exchange: String,

    /// AMQP receive queue (default: richmond.receive)
    #[argh(option, default = "String::from(\"richmond.receive\")")]
    pub amqp_receive_queue: String,

    /// AMQP routing key for the receive queue (default: ssmi.receive)
    #[argh(option, default = "String::from(\"ssmi.receive\")")]
    pub amqp_receive_routing_key: String,

    /// AMQP exchange undeliverable send commands are dead-lettered to, empty
    /// disables dead-lettering (default: richmond.dead)
    #[argh(option, default = "String::from(\"richmond.dead\")")]
    pub amqp_dead_letter_exchange: String,

    /// AMQP queue bound to the dead-letter exchange (default: richmond.dead)
    #[argh(option, default = "String::from(\"richmond.dead\")")]
    pub amqp_dead_letter_queue: String,

    /// reconnect attempts after the bridge drops, 0 retries forever (default: 10)
    #[argh(option, default = "10")]
    pub retry_max_attempts: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required option --{0}")]
    Missing(&'static str),

    #[error("invalid value for --{option}: {reason}")]
    Invalid { option: &'static str, reason: String },
}

/// Broker connection and topology names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub send_queue: String,
    pub send_routing_key: String,
    pub receive_queue: String,
    pub receive_routing_key: String,
    /// Where rejected send commands go; `None` lets the broker drop them
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_queue: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "richmond".to_string(),
            password: "richmond".to_string(),
            vhost: "/richmond".to_string(),
            exchange: "richmond".to_string(),
            send_queue: "richmond.send".to_string(),
            send_routing_key: "ssmi.send".to_string(),
            receive_queue: "richmond.receive".to_string(),
            receive_routing_key: "ssmi.receive".to_string(),
            dead_letter_exchange: Some("richmond.dead".to_string()),
            dead_letter_queue: "richmond.dead".to_string(),
        }
    }
}

/// Protocol endpoint address and login.
#[derive(Debug, Clone)]
pub struct SsmiSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// How long to wait for the gateway to answer the login
    pub login_timeout: Duration,
    pub keep_alive: KeepAliveConfig,
}

impl SsmiSettings {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            login_timeout: Duration::from_secs(10),
            keep_alive: KeepAliveConfig::default(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

/// Everything `bridge::start` needs.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub amqp: AmqpSettings,
    pub ssmi: SsmiSettings,
    pub retry: RetryPolicy,
}

impl BridgeConfig {
    pub fn new(amqp: AmqpSettings, ssmi: SsmiSettings) -> Self {
        Self {
            amqp,
            ssmi,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl TryFrom<Options> for BridgeConfig {
    type Error = ConfigError;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        let ssmi_host = options
            .ssmi_host
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::Missing("ssmi-host"))?;
        let ssmi_port = options.ssmi_port.ok_or(ConfigError::Missing("ssmi-port"))?;
        if ssmi_port == 0 {
            return Err(ConfigError::Invalid {
                option: "ssmi-port",
                reason: "port 0 is not connectable".to_string(),
            });
        }

        let keep_alive = if options.keep_alive_interval == 0 {
            KeepAliveConfig::disabled()
        } else {
            KeepAliveConfig::new(Duration::from_secs(options.keep_alive_interval))
        };

        let amqp = AmqpSettings {
            host: options.amqp_host,
            port: options.amqp_port,
            username: options.amqp_username,
            password: options.amqp_password,
            vhost: options.amqp_vhost,
            exchange: options.amqp_exchange,
            send_queue: options.amqp_send_queue,
            send_routing_key: options.amqp_send_routing_key,
            receive_queue: options.amqp_receive_queue,
            receive_routing_key: options.amqp_receive_routing_key,
            dead_letter_exchange: Some(options.amqp_dead_letter_exchange)
                .filter(|name| !name.is_empty()),
            dead_letter_queue: options.amqp_dead_letter_queue,
        };

        let ssmi = SsmiSettings::new(
            ssmi_host,
            ssmi_port,
            options.ssmi_username.unwrap_or_default(),
            options.ssmi_password.unwrap_or_default(),
        )
        .with_keep_alive(keep_alive);

        let retry = RetryPolicy::default().with_max_attempts(options.retry_max_attempts);

        Ok(BridgeConfig::new(amqp, ssmi).with_retry(retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::from_args(&["ssmi-bridge"], args).unwrap()
    }

    #[test]
    fn defaults_match_the_published_layout() {
        let config = BridgeConfig::try_from(parse(&[
            "--ssmi-host",
            "ssmi.example.org",
            "--ssmi-port",
            "9000",
        ]))
        .unwrap();

        assert_eq!(config.amqp, AmqpSettings::default());
        assert_eq!(config.amqp.send_routing_key, "ssmi.send");
        assert_eq!(config.amqp.receive_routing_key, "ssmi.receive");
        assert_eq!(
            config.amqp.dead_letter_exchange.as_deref(),
            Some("richmond.dead")
        );
        assert_eq!(config.ssmi.host, "ssmi.example.org");
        assert_eq!(config.ssmi.port, 9000);
        assert_eq!(config.ssmi.keep_alive.interval, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 10);
    }

    #[test]
    fn options_override_defaults() {
        let config = BridgeConfig::try_from(parse(&[
            "--ssmi-host",
            "gw",
            "--ssmi-port",
            "9000",
            "--ssmi-username",
            "user",
            "--ssmi-password",
            "pass",
            "--amqp-exchange",
            "vumi",
            "--amqp-vhost",
            "/",
            "--keep-alive-interval",
            "0",
            "--amqp-dead-letter-exchange",
            "",
        ]))
        .unwrap();

        assert_eq!(config.amqp.exchange, "vumi");
        assert_eq!(config.amqp.vhost, "/");
        assert_eq!(config.ssmi.username, "user");
        assert_eq!(config.ssmi.password, "pass");
        assert!(!config.ssmi.keep_alive.enabled);
        assert_eq!(config.amqp.dead_letter_exchange, None);
    }

    #[test]
    fn endpoint_address_is_required() {
        let err = BridgeConfig::try_from(parse(&["--ssmi-port", "9000"])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("ssmi-host"));

        let err = BridgeConfig::try_from(parse(&["--ssmi-host", "gw"])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("ssmi-port"));

        let err =
            BridgeConfig::try_from(parse(&["--ssmi-host", "gw", "--ssmi-port", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { option: "ssmi-port", .. }));
    }
}
