//! Built-in chat commands.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    Status,
    Help,
    Clear,
}

/// Recognized commands only; any other slash input goes to the assistant.
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let normalized = input.trim().to_ascii_lowercase();
    if !normalized.starts_with('/') {
        return None;
    }
    match normalized.as_str() {
        "/status" => Some(ChatCommand::Status),
        "/help" => Some(ChatCommand::Help),
        "/clear" => Some(ChatCommand::Clear),
        _ => None,
    }
}

pub struct StatusSnapshot<'a> {
    pub sessions: usize,
    pub messages: u64,
    pub uptime: Duration,
    pub model: &'a str,
    pub channels: &'a [String],
}

pub fn status_reply(status: &StatusSnapshot<'_>) -> String {
    format!(
        "Bot status\n\nstate: running\nactive sessions: {}\nmessages handled: {}\nuptime: {}\nmodel: {}\nchannels: {}",
        status.sessions,
        status.messages,
        format_uptime(status.uptime),
        status.model,
        status.channels.join(","),
    )
}

pub fn help_reply() -> String {
    [
        "Commands:",
        "/status - show bot status",
        "/help - show this help",
        "/clear - forget this chat's conversation",
        "",
        "Tips:",
        "- in group chats, mention the bot to get a reply",
        "- in private chats, just send a message",
        "- the bot remembers the conversation until /clear",
    ]
    .join("\n")
}

pub fn clear_reply(cleared: bool) -> &'static str {
    if cleared {
        "Conversation cleared. The next message starts a new one."
    } else {
        "No active conversation in this chat."
    }
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, hours, minutes, seconds) = (
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
    );
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_trimmed_and_case_insensitive() {
        assert_eq!(parse_command("  /STATUS "), Some(ChatCommand::Status));
        assert_eq!(parse_command("/help"), Some(ChatCommand::Help));
        assert_eq!(parse_command("/Clear"), Some(ChatCommand::Clear));
    }

    #[test]
    fn unknown_slash_input_is_not_a_command() {
        assert_eq!(parse_command("/model gpt-5"), None);
        assert_eq!(parse_command("/status please"), None);
        assert_eq!(parse_command("status"), None);
    }

    #[test]
    fn status_reply_lists_counters() {
        let channels = vec!["webchat".to_string()];
        let text = status_reply(&StatusSnapshot {
            sessions: 3,
            messages: 42,
            uptime: Duration::from_secs(3_725),
            model: "gpt-5-codex",
            channels: &channels,
        });
        assert!(text.contains("active sessions: 3"));
        assert!(text.contains("messages handled: 42"));
        assert!(text.contains("uptime: 1h 2m 5s"));
        assert!(text.contains("channels: webchat"));
    }

    #[test]
    fn uptime_formats_by_magnitude() {
        assert_eq!(format_uptime(Duration::from_secs(9)), "9s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m 1s");
        assert_eq!(format_uptime(Duration::from_secs(90_061)), "1d 1h 1m");
    }

    #[test]
    fn help_mentions_every_command() {
        let help = help_reply();
        for command in ["/status", "/help", "/clear"] {
            assert!(help.contains(command));
        }
    }
}
