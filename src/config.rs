//! Configuration module
//!
//! Provides typed access to the softphone options, either constructed
//! programmatically or loaded from environment variables.

use anyhow::{bail, Context, Result};
use std::env;
use std::time::Duration;

/// Typed configuration keys
///
/// Using an enum for config keys provides compile-time safety
/// and prevents typos compared to string literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    // SIP account
    SipServer,
    SipPort,
    SipUsername,
    SipPassword,

    // Local endpoint
    LocalIp,
    LocalPort,

    // Optional outbound proxy for all sends
    OutboundProxy,

    // RTP port range for media sessions
    RtpPortLow,
    RtpPortHigh,

    // Learn public address from Via received/rport
    BehindNat,

    // Registration lifetimes
    DefaultExpiresSecs,
    RegisterTimeoutSecs,

    // Shave this many milliseconds off the 20ms RTP send clock
    // to counter scheduler jitter
    TransmitDelayReductionMs,
}

impl ConfigKey {
    /// Get the environment variable name for this key
    pub fn env_var(&self) -> &'static str {
        match self {
            ConfigKey::SipServer => "SIP_SERVER",
            ConfigKey::SipPort => "SIP_PORT",
            ConfigKey::SipUsername => "SIP_USERNAME",
            ConfigKey::SipPassword => "SIP_PASSWORD",
            ConfigKey::LocalIp => "LOCAL_IP",
            ConfigKey::LocalPort => "LOCAL_PORT",
            ConfigKey::OutboundProxy => "OUTBOUND_PROXY",
            ConfigKey::RtpPortLow => "RTP_PORT_LOW",
            ConfigKey::RtpPortHigh => "RTP_PORT_HIGH",
            ConfigKey::BehindNat => "BEHIND_NAT",
            ConfigKey::DefaultExpiresSecs => "DEFAULT_EXPIRES_SECS",
            ConfigKey::RegisterTimeoutSecs => "REGISTER_TIMEOUT_SECS",
            ConfigKey::TransmitDelayReductionMs => "TRANSMIT_DELAY_REDUCTION_MS",
        }
    }

    /// Check if this key is required (no default value)
    pub fn is_required(&self) -> bool {
        matches!(
            self,
            ConfigKey::SipServer | ConfigKey::SipUsername | ConfigKey::SipPassword
        )
    }

    /// Get default value for this key (if any)
    pub fn default_value(&self) -> Option<&'static str> {
        match self {
            ConfigKey::SipPort => Some("5060"),
            ConfigKey::LocalIp => Some("0.0.0.0"),
            ConfigKey::LocalPort => Some("5060"),
            ConfigKey::RtpPortLow => Some("10000"),
            ConfigKey::RtpPortHigh => Some("20000"),
            ConfigKey::BehindNat => Some("false"),
            ConfigKey::DefaultExpiresSecs => Some("120"),
            ConfigKey::RegisterTimeoutSecs => Some("30"),
            ConfigKey::TransmitDelayReductionMs => Some("0"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // SIP account
    pub server: String,
    pub port: u16,
    pub username: String,
    /// SIP password - used for RFC 2617 digest authentication.
    /// When the registrar responds with 401, the client retries once
    /// using this password to compute the digest response.
    pub password: String,

    /// Local IP to bind; an IPv6 literal selects an IPv6 socket
    pub local_ip: String,
    pub local_port: u16,

    /// Optional outbound proxy host; all requests go there instead of
    /// the registrar when set
    pub proxy: Option<String>,

    /// RTP media ports are allocated as even ports in this range,
    /// with the adjacent odd port reserved for RTCP
    pub rtp_port_low: u16,
    pub rtp_port_high: u16,

    /// When set, record `received`/`rport` from the registrar's Via as
    /// our public address and advertise it in Contact/SDP
    pub behind_nat: bool,

    /// REGISTER Expires value; the refresh timer fires 5s early
    pub default_expires: u32,

    /// How long synchronous REGISTER/SUBSCRIBE exchanges wait for a reply
    pub register_timeout: Duration,

    /// Shaved off the 20ms RTP send clock to counter scheduler jitter
    pub transmit_delay_reduction: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key.env_var()).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(ConfigKey) -> Option<String>,
    {
        let value = |key: ConfigKey| -> Option<String> {
            get(key).or_else(|| key.default_value().map(|v| v.to_string()))
        };
        let parsed = |key: ConfigKey| -> Result<String> {
            value(key).context(key.env_var())
        };

        Ok(Config {
            server: parsed(ConfigKey::SipServer)?,
            port: parsed(ConfigKey::SipPort)?
                .parse()
                .context("SIP_PORT must be a valid port number")?,
            username: parsed(ConfigKey::SipUsername)?,
            password: parsed(ConfigKey::SipPassword)?,

            local_ip: parsed(ConfigKey::LocalIp)?,
            local_port: parsed(ConfigKey::LocalPort)?
                .parse()
                .context("LOCAL_PORT must be a valid port number")?,

            proxy: get(ConfigKey::OutboundProxy).filter(|s| !s.is_empty()),

            rtp_port_low: parsed(ConfigKey::RtpPortLow)?
                .parse()
                .context("RTP_PORT_LOW must be a valid port number")?,
            rtp_port_high: parsed(ConfigKey::RtpPortHigh)?
                .parse()
                .context("RTP_PORT_HIGH must be a valid port number")?,

            behind_nat: value(ConfigKey::BehindNat)
                .map(|s| s.eq_ignore_ascii_case("true") || s == "1")
                .unwrap_or(false),

            default_expires: parsed(ConfigKey::DefaultExpiresSecs)?
                .parse()
                .context("DEFAULT_EXPIRES_SECS must be a number of seconds")?,
            register_timeout: Duration::from_secs(
                parsed(ConfigKey::RegisterTimeoutSecs)?
                    .parse()
                    .context("REGISTER_TIMEOUT_SECS must be a number of seconds")?,
            ),
            transmit_delay_reduction: Duration::from_millis(
                parsed(ConfigKey::TransmitDelayReductionMs)?
                    .parse()
                    .context("TRANSMIT_DELAY_REDUCTION_MS must be a number of milliseconds")?,
            ),
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &std::collections::HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key.env_var()).map(|v| v.to_string()))
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.local_ip.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!(
                "LOCAL_IP '{}' is not an IPv4 or IPv6 literal.",
                self.local_ip
            ));
        }

        if self.rtp_port_low >= self.rtp_port_high {
            errors.push(format!(
                "RTP_PORT_LOW={} must be below RTP_PORT_HIGH={}.",
                self.rtp_port_low, self.rtp_port_high
            ));
        }
        if self.rtp_port_low < 1024 {
            errors.push("RTP_PORT_LOW must be at least 1024.".to_string());
        }

        // The refresh timer fires at expires - 5s
        if self.default_expires <= 5 {
            errors.push(format!(
                "DEFAULT_EXPIRES_SECS={} must be greater than 5.",
                self.default_expires
            ));
        }

        if self.register_timeout.is_zero() {
            errors.push("REGISTER_TIMEOUT_SECS must be greater than 0.".to_string());
        }

        if self.transmit_delay_reduction >= Duration::from_millis(20) {
            errors.push(
                "TRANSMIT_DELAY_REDUCTION_MS must be below the 20ms packet clock.".to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }
}
