//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.rcebot/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default command execution timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(15);

/// Default command exit timeout.
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    #[serde(default)]
    pub token: String,

    /// Custom Bot API base URL. Empty means the official API.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    /// Webhook listener settings. When disabled, long-poll getUpdates is used.
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Authorized users and the commands each may run.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// Webhook listener config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub enabled: bool,

    /// "tcp" (default) or "unix".
    #[serde(default = "default_listen_network")]
    pub listen_network: String,

    /// Address the listener binds to: "host:port" for tcp (default "127.0.0.1:8080"), a
    /// socket path for unix.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Owner of the unix domain socket, as a user id or user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_owner: Option<IdOrName>,

    /// Group of the unix domain socket, as a group id or group name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_group: Option<IdOrName>,

    /// Permission bits of the unix domain socket, written as an octal string ("0660").
    #[serde(default, with = "file_mode", skip_serializing_if = "Option::is_none")]
    pub listen_mode: Option<u32>,

    /// Optional secret checked against the X-Telegram-Bot-Api-Secret-Token header.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_token: String,

    /// Public URL Telegram POSTs updates to.
    #[serde(default)]
    pub url: String,
}

fn default_listen_network() -> String {
    "tcp".to_string()
}

fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_network: default_listen_network(),
            listen_address: default_listen_address(),
            listen_owner: None,
            listen_group: None,
            listen_mode: None,
            secret_token: String::new(),
            url: String::new(),
        }
    }
}

/// A numeric id or a name to be looked up (socket owner and group).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdOrName {
    Id(u32),
    Name(String),
}

/// An authorized user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    /// Telegram user id.
    pub id: i64,

    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

/// A command the user may execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandConfig {
    /// Program name or path. Resolved through PATH; no shell is involved.
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// After this long the process receives an interrupt. Absent or zero means 15s.
    #[serde(default, with = "duration", skip_serializing_if = "Option::is_none")]
    pub exec_timeout: Option<Duration>,

    /// After an interrupt, the process is killed if still running this long. Absent or zero means 5s.
    #[serde(default, with = "duration", skip_serializing_if = "Option::is_none")]
    pub exit_timeout: Option<Duration>,
}

impl CommandConfig {
    pub fn exec_timeout(&self) -> Duration {
        self.exec_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_EXEC_TIMEOUT)
    }

    pub fn exit_timeout(&self) -> Duration {
        self.exit_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_EXIT_TIMEOUT)
    }
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            let t = config.token.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RCEBOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".rcebot").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Unlike an optional settings file,
/// a missing file is an error: without users the bot has nothing to do.
pub fn load_config(path: &Path) -> Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let config = serde_json::from_str(&s)
        .with_context(|| format!("parsing config from {}", path.display()))?;
    Ok(config)
}

/// Write the config back as pretty JSON (used to normalize formatting).
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let mut s = serde_json::to_string_pretty(config).context("serializing config")?;
    s.push('\n');
    std::fs::write(path, s).with_context(|| format!("writing config to {}", path.display()))?;
    Ok(())
}

/// Parse a duration like "15s", "1m30s", "250ms" or "1h". Units: ns, us, µs, ms, s, m, h.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {:?}: expected a number", s));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {:?}: bad number", s))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("invalid duration {:?}: missing unit", s)),
            unit => return Err(format!("invalid duration {:?}: unknown unit {:?}", s, unit)),
        };
        rest = &rest[unit_len..];
        total += Duration::from_nanos((value * nanos_per_unit).round() as u64);
    }
    Ok(total)
}

/// Format a duration in the same notation [`parse_duration`] accepts: "1.5s", "1m30s",
/// "1h0m0s", "250ms".
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000_000_000 {
        let (scale, unit) = match nanos {
            0..=999 => (1, "ns"),
            1_000..=999_999 => (1_000, "µs"),
            _ => (1_000_000, "ms"),
        };
        return format!("{}{}", format_fraction(nanos, scale), unit);
    }

    let secs = d.as_secs();
    let (h, m) = (secs / 3600, (secs % 3600) / 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if h > 0 || m > 0 {
        out.push_str(&format!("{}m", m));
    }
    let sec_nanos = u128::from(secs % 60) * 1_000_000_000 + u128::from(d.subsec_nanos());
    out.push_str(&format_fraction(sec_nanos, 1_000_000_000));
    out.push('s');
    out
}

/// `value / scale` as a decimal with trailing zeros trimmed. `scale` is a power of ten.
fn format_fraction(value: u128, scale: u128) -> String {
    let (whole, frac) = (value / scale, value % scale);
    if frac == 0 {
        return whole.to_string();
    }
    let digits = scale.ilog10() as usize;
    let frac = format!("{:0width$}", frac, width = digits);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Serde adapter for optional durations written as strings ("15s") or integer seconds.
mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&super::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Option<Duration>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration string like \"15s\" or a number of seconds")
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Some(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|v| Some(Duration::from_secs(v)))
                    .map_err(|_| E::custom("duration must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                super::parse_duration(v).map(Some).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Serde adapter for optional file modes written as octal strings ("0660").
mod file_mode {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(mode) => serializer.serialize_str(&format!("{:04o}", mode)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        let Some(s) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        let digits = s.trim();
        let digits = digits.strip_prefix("0o").unwrap_or(digits);
        let mode = u32::from_str_radix(digits, 8)
            .map_err(|_| de::Error::custom(format!("invalid file mode {:?}: expected an octal string like \"0660\"", s)))?;
        if mode > 0o7777 {
            return Err(de::Error::custom(format!("invalid file mode {:?}: out of range", s)));
        }
        Ok(Some(mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(" 10us ").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn format_duration_round_trips_common_values() {
        for d in [
            Duration::from_secs(5),
            Duration::from_secs(90),
            Duration::from_secs(3725),
            Duration::from_millis(1500),
        ] {
            assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
        }
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
    }

    #[test]
    fn format_duration_uses_fractional_units() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_duration(Duration::from_nanos(10)), "10ns");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
        assert_eq!(format_duration(Duration::from_millis(90_500)), "1m30.5s");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn command_timeouts_default_when_absent_or_zero() {
        let json = r#"{"name":"uptime","execTimeout":"0s"}"#;
        let cmd: CommandConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.exec_timeout(), DEFAULT_EXEC_TIMEOUT);
        assert_eq!(cmd.exit_timeout(), DEFAULT_EXIT_TIMEOUT);
    }

    #[test]
    fn command_timeouts_accept_strings_and_seconds() {
        let json = r#"{"name":"sleep","args":["10"],"execTimeout":"2s","exitTimeout":1}"#;
        let cmd: CommandConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.args, vec!["10".to_string()]);
        assert_eq!(cmd.exec_timeout(), Duration::from_secs(2));
        assert_eq!(cmd.exit_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn full_config_parses() {
        let json = r#"{
            "token": "123:abc",
            "webhook": {"enabled": true, "url": "https://example.com/hook", "secretToken": "s3cret"},
            "users": [{"id": 42, "commands": [{"name": "uptime"}]}]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.token, "123:abc");
        assert!(config.webhook.enabled);
        assert_eq!(config.webhook.listen_address, "127.0.0.1:8080");
        assert_eq!(config.webhook.secret_token, "s3cret");
        assert_eq!(config.users.len(), 1);
        assert_eq!(config.users[0].id, 42);
        assert_eq!(config.users[0].commands[0].name, "uptime");
    }

    #[test]
    fn unix_socket_webhook_config_round_trips() {
        let json = r#"{
            "enabled": true,
            "listenNetwork": "unix",
            "listenAddress": "/run/rcebot.sock",
            "listenOwner": "www-data",
            "listenGroup": 33,
            "listenMode": "0660",
            "url": "https://example.com/hook"
        }"#;
        let webhook: WebhookConfig = serde_json::from_str(json).unwrap();
        assert_eq!(webhook.listen_network, "unix");
        assert_eq!(webhook.listen_owner, Some(IdOrName::Name("www-data".to_string())));
        assert_eq!(webhook.listen_group, Some(IdOrName::Id(33)));
        assert_eq!(webhook.listen_mode, Some(0o660));

        let out = serde_json::to_value(&webhook).unwrap();
        assert_eq!(out["listenMode"], "0660");
        assert_eq!(out["listenGroup"], 33);
        let again: WebhookConfig = serde_json::from_value(out).unwrap();
        assert_eq!(again, webhook);
    }

    #[test]
    fn webhook_defaults_to_tcp_without_socket_settings() {
        let webhook: WebhookConfig = serde_json::from_str(r#"{"listenMode": null}"#).unwrap();
        assert_eq!(webhook, WebhookConfig::default());
        let out = serde_json::to_value(&webhook).unwrap();
        assert!(out.get("listenOwner").is_none());
        assert!(out.get("listenMode").is_none());
    }

    #[test]
    fn bad_file_mode_fails_config_parse() {
        for mode in [r#""rw-rw----""#, r#""0989""#, r#""17777""#, "660"] {
            let json = format!(r#"{{"listenMode": {}}}"#, mode);
            assert!(serde_json::from_str::<WebhookConfig>(&json).is_err(), "{}", mode);
        }
    }

    #[test]
    fn bad_duration_fails_config_parse() {
        let json = r#"{"users": [{"id": 1, "commands": [{"name": "x", "execTimeout": "soon"}]}]}"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rcebot-config-test-{}.json", uuid::Uuid::new_v4()));
        let config: Config = serde_json::from_str(
            r#"{"token":"t","users":[{"id":7,"commands":[{"name":"echo","args":["hi there"],"exitTimeout":"2s"}]}]}"#,
        )
        .unwrap();
        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded.users[0].commands, config.users[0].commands);
        assert_eq!(
            loaded.users[0].commands[0].exit_timeout,
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let path = std::env::temp_dir().join("rcebot-definitely-missing-config.json");
        assert!(load_config(&path).is_err());
    }
}
