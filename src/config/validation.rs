//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use crate::network::{self, PROTOCOL};
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("timers.{0} must be greater than zero")]
    ZeroTimer(&'static str),
    #[error("timers.typing_idle ({idle}s) must exceed timers.typing_resend ({resend}s)")]
    TypingWindow { idle: u64, resend: u64 },
    #[error("accounts[{index}]: unknown protocol '{protocol}'")]
    UnknownProtocol { index: usize, protocol: String },
    #[error("accounts[{index}]: {reason}")]
    InvalidParameters { index: usize, reason: String },
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let timers = &config.timers;
    for (name, value) in [
        ("typing_resend", timers.typing_resend),
        ("typing_idle", timers.typing_idle),
        ("empty_channel", timers.empty_channel),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroTimer(name));
        }
    }
    // A remote typing notice must outlive the resend interval or it flaps.
    if timers.typing_idle <= timers.typing_resend {
        errors.push(ValidationError::TypingWindow {
            idle: timers.typing_idle,
            resend: timers.typing_resend,
        });
    }

    for (index, block) in config.accounts.iter().enumerate() {
        if block.protocol != PROTOCOL {
            errors.push(ValidationError::UnknownProtocol {
                index,
                protocol: block.protocol.clone(),
            });
            continue;
        }
        if let Err(e) = network::ConnectionParams::from_map(&block.params) {
            errors.push(ValidationError::InvalidParameters {
                index,
                reason: e.to_string(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes() {
        let config: Config = toml::from_str("").unwrap();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_timer_fails() {
        let config: Config = toml::from_str("[timers]\nempty_channel = 0").unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::ZeroTimer("empty_channel")))
        );
    }

    #[test]
    fn test_typing_window_fails() {
        let config: Config =
            toml::from_str("[timers]\ntyping_resend = 8\ntyping_idle = 8").unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::TypingWindow { .. }))
        );
    }

    #[test]
    fn test_account_without_password_fails() {
        let toml = r#"
[[accounts]]
account = "me@example.com"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(matches!(
            errors.as_slice(),
            [ValidationError::InvalidParameters { index: 0, .. }]
        ));
    }

    #[test]
    fn test_unknown_protocol_fails() {
        let toml = r#"
[[accounts]]
protocol = "irc"
account = "me@example.com"
password = "x"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, ValidationError::UnknownProtocol { .. }))
        );
    }

    #[test]
    fn test_all_errors_collected() {
        let toml = r#"
[timers]
typing_resend = 0

[[accounts]]
protocol = "xmpp"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let errors = validate(&config).unwrap_err();
        assert!(errors.len() >= 2);
    }
}
