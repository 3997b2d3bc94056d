//! Stateless admission and presentation policies.
//!
//! Every function here is total: malformed or absent input yields the
//! restrictive answer instead of an error.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Message shown to chat users whenever a turn fails.
pub const USER_FACING_FAILURE: &str = "Processing failed, please try again later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive level parse; anything unrecognized falls back to `Info`.
pub fn parse_log_level(raw: Option<&str>) -> LogLevel {
    let level = raw.unwrap_or_default().trim().to_ascii_lowercase();
    match level.as_str() {
        "debug" => LogLevel::Debug,
        "info" => LogLevel::Info,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

/// True iff `bot_id` is non-empty and one of the mention ids equals it exactly.
pub fn is_bot_mentioned<'a, I>(mention_ids: I, bot_id: Option<&str>) -> bool
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let Some(bot_id) = bot_id.filter(|id| !id.is_empty()) else {
        return false;
    };
    mention_ids.into_iter().flatten().any(|id| id == bot_id)
}

/// Dashboard API gate.
///
/// With a configured token only an exact `Bearer <token>` header passes,
/// whatever the origin. Without one, only loopback peers pass.
pub fn is_authorized(
    auth_header: Option<&str>,
    configured_token: Option<&str>,
    origin: Option<IpAddr>,
) -> bool {
    if let Some(token) = configured_token.filter(|t| !t.is_empty()) {
        let expected = format!("Bearer {token}");
        return auth_header == Some(expected.as_str());
    }
    origin.is_some_and(is_loopback_origin)
}

fn is_loopback_origin(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => {
            v6 == Ipv6Addr::LOCALHOST || v6.to_ipv4_mapped() == Some(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Never echoes the error; details belong in logs only.
pub fn sanitize_error<E: ?Sized>(_error: &E) -> &'static str {
    USER_FACING_FAILURE
}

/// True iff the event was created more than `max_age` before `now`.
/// Events without a creation time are never stale.
pub fn is_stale(created_at: Option<DateTime<Utc>>, now: DateTime<Utc>, max_age: Duration) -> bool {
    created_at.is_some_and(|created_at| now - created_at > max_age)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn ip(raw: &str) -> Option<IpAddr> {
        Some(IpAddr::from_str(raw).expect("ip literal"))
    }

    #[test]
    fn bot_mention_requires_exact_id() {
        let mentions = [Some("ou_user_1"), None, Some("ou_bot_123")];
        assert!(is_bot_mentioned(mentions, Some("ou_bot_123")));
        assert!(!is_bot_mentioned(mentions, Some("ou_other_bot")));
        assert!(!is_bot_mentioned(mentions, Some("ou_bot")));
        assert!(!is_bot_mentioned(mentions, None));
        assert!(!is_bot_mentioned(mentions, Some("")));
        assert!(!is_bot_mentioned(Vec::<Option<&str>>::new(), Some("ou_bot_123")));
    }

    #[test]
    fn configured_token_requires_exact_bearer_header() {
        assert!(is_authorized(Some("Bearer secret"), Some("secret"), ip("10.0.0.2")));
        assert!(!is_authorized(None, Some("secret"), ip("127.0.0.1")));
        assert!(!is_authorized(Some("Bearer wrong"), Some("secret"), ip("127.0.0.1")));
        assert!(!is_authorized(Some("bearer secret"), Some("secret"), ip("127.0.0.1")));
        assert!(!is_authorized(Some("Bearer  secret"), Some("secret"), None));
    }

    #[test]
    fn missing_token_allows_loopback_only() {
        assert!(is_authorized(None, None, ip("127.0.0.1")));
        assert!(is_authorized(None, None, ip("::1")));
        assert!(is_authorized(None, None, ip("::ffff:127.0.0.1")));
        assert!(is_authorized(Some("Bearer anything"), Some(""), ip("127.0.0.1")));
        assert!(!is_authorized(None, None, ip("10.0.0.2")));
        assert!(!is_authorized(None, None, ip("127.0.0.2")));
        assert!(!is_authorized(None, None, None));
    }

    #[test]
    fn sanitize_error_hides_internal_details() {
        let err = std::io::Error::other("secret path D:/repo/.env");
        let msg = sanitize_error(&err);
        assert_eq!(msg, USER_FACING_FAILURE);
        assert!(!msg.contains("secret path"));
        assert!(!msg.contains(".env"));
    }

    #[test]
    fn parse_log_level_defaults_to_info() {
        assert_eq!(parse_log_level(Some("debug")), LogLevel::Debug);
        assert_eq!(parse_log_level(Some("ERROR")), LogLevel::Error);
        assert_eq!(parse_log_level(Some(" Warn ")), LogLevel::Warn);
        assert_eq!(parse_log_level(Some("unknown")), LogLevel::Info);
        assert_eq!(parse_log_level(None), LogLevel::Info);
    }

    #[test]
    fn stale_only_past_max_age() {
        let now = Utc::now();
        let max_age = Duration::seconds(60);
        assert!(!is_stale(None, now, max_age));
        assert!(!is_stale(Some(now - Duration::seconds(10)), now, max_age));
        assert!(!is_stale(Some(now - max_age), now, max_age));
        assert!(is_stale(Some(now - Duration::seconds(61)), now, max_age));
        assert!(!is_stale(Some(now + Duration::seconds(5)), now, max_age));
    }
}
