//! Batched alert messages.
//!
//! One poll cycle produces at most two messages: one listing every channel
//! confirmed down in the cycle and one listing every recovered channel.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::time::Duration;

use crate::scheduler::ChannelEvent;

/// Settings key overriding the body of the "down" message.
pub const DOWN_TEMPLATE_KEY: &str = "template.down";
/// Settings key overriding the body of the "recovered" message.
pub const RECOVERED_TEMPLATE_KEY: &str = "template.recovered";

const DEFAULT_DOWN_TEMPLATE: &str = "🚨 *SIGNAL MONITOR - CHANNELS DOWN*

📡 *{total} channel(s) down:*

{channel_list}

🕐 *Time:* {time}
📅 *Date:* {date}

⚠️ Confirmed after {threshold_checks} consecutive checks ({threshold_duration}).";

const DEFAULT_RECOVERED_TEMPLATE: &str = "✅ *SIGNAL MONITOR - CHANNELS BACK*

📡 *{total} channel(s) recovered:*

{channel_list}

🕐 *Time:* {time}
📅 *Date:* {date}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Down,
    Recovered,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Down => "down",
            MessageKind::Recovered => "recovered",
        }
    }
}

/// A rendered message ready for every destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub channel_count: usize,
    pub text: String,
}

/// Everything rendering needs besides the events themselves.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub fail_threshold: u32,
    pub poll_interval: Duration,
    pub timezone: Tz,
    pub down_template: Option<String>,
    pub recovered_template: Option<String>,
}

impl MessageContext {
    /// How long a channel must fail before it is reported, derived from the
    /// threshold and the poll interval.
    pub fn threshold_duration(&self) -> String {
        format_duration(self.poll_interval.as_secs() as i64 * i64::from(self.fail_threshold))
    }
}

/// Render the batched messages for one cycle. Empty directions produce no message.
pub fn build_messages(events: &[ChannelEvent], ctx: &MessageContext, now: DateTime<Utc>) -> Vec<OutboundMessage> {
    let (down, recovered): (Vec<&ChannelEvent>, Vec<&ChannelEvent>) = events.iter().partition(|e| e.is_down());

    let mut messages = Vec::with_capacity(2);
    if !down.is_empty() {
        let template = ctx.down_template.as_deref().unwrap_or(DEFAULT_DOWN_TEMPLATE);
        messages.push(OutboundMessage {
            kind: MessageKind::Down,
            channel_count: down.len(),
            text: render(template, &down, ctx, now),
        });
    }
    if !recovered.is_empty() {
        let template = ctx.recovered_template.as_deref().unwrap_or(DEFAULT_RECOVERED_TEMPLATE);
        messages.push(OutboundMessage {
            kind: MessageKind::Recovered,
            channel_count: recovered.len(),
            text: render(template, &recovered, ctx, now),
        });
    }
    messages
}

fn render(template: &str, events: &[&ChannelEvent], ctx: &MessageContext, now: DateTime<Utc>) -> String {
    let local = now.with_timezone(&ctx.timezone);
    let channel_list = events
        .iter()
        .map(|event| list_line(event, ctx.timezone))
        .collect::<Vec<_>>()
        .join("\n");

    // The channel list goes in last so placeholders inside names stay literal.
    template
        .replace("{total}", &events.len().to_string())
        .replace("{time}", &local.format("%H:%M:%S").to_string())
        .replace("{date}", &local.format("%d/%m/%Y").to_string())
        .replace("{threshold_checks}", &ctx.fail_threshold.to_string())
        .replace("{threshold_duration}", &ctx.threshold_duration())
        .replace("{channel_list}", &channel_list)
}

fn list_line(event: &ChannelEvent, tz: Tz) -> String {
    match event {
        ChannelEvent::Down { channel, down_since } => format!(
            "• {} ({}) - down since {}",
            channel.channel_name,
            channel.source_name,
            down_since.with_timezone(&tz).format("%H:%M:%S")
        ),
        ChannelEvent::Recovered {
            channel,
            downtime_seconds,
            ..
        } => format!(
            "• {} ({}) - offline for {}",
            channel.channel_name,
            channel.source_name,
            format_duration(*downtime_seconds)
        ),
    }
}

/// `1h 5m`, `4m 10s` or `42s`.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ChannelRef;
    use chrono::TimeZone;

    fn ctx() -> MessageContext {
        MessageContext {
            fail_threshold: 3,
            poll_interval: Duration::from_secs(30),
            timezone: Tz::UTC,
            down_template: None,
            recovered_template: None,
        }
    }

    fn channel(id: &str, source: &str) -> ChannelRef {
        ChannelRef {
            channel_id: id.to_string(),
            channel_name: format!("Channel {}", id),
            source_id: source.to_string(),
            source_name: format!("Server {}", source),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 4, 15, 30, 0).unwrap()
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(250), "4m 10s");
        assert_eq!(format_duration(3900), "1h 5m");
        assert_eq!(format_duration(-5), "0s");
    }

    #[test]
    fn test_one_message_per_direction() {
        let events = vec![
            ChannelEvent::Down { channel: channel("a", "s1"), down_since: now() },
            ChannelEvent::Down { channel: channel("b", "s1"), down_since: now() },
            ChannelEvent::Down { channel: channel("c", "s2"), down_since: now() },
        ];
        let messages = build_messages(&events, &ctx(), now());
        assert_eq!(messages.len(), 1);

        let msg = &messages[0];
        assert_eq!(msg.kind, MessageKind::Down);
        assert_eq!(msg.channel_count, 3);
        for name in ["Channel a", "Channel b", "Channel c"] {
            assert!(msg.text.contains(name), "missing {} in {}", name, msg.text);
        }
        assert!(msg.text.contains("• Channel c (Server s2) - down since 15:30:00"));
        assert!(msg.text.contains("3 consecutive checks (1m 30s)"));
    }

    #[test]
    fn test_recovered_lines_and_mixed_cycle() {
        let events = vec![
            ChannelEvent::Recovered {
                channel: channel("a", "s1"),
                down_since: now(),
                downtime_seconds: 250,
            },
            ChannelEvent::Down { channel: channel("b", "s1"), down_since: now() },
        ];
        let messages = build_messages(&events, &ctx(), now());
        let kinds: Vec<_> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MessageKind::Down, MessageKind::Recovered]);
        assert!(messages[1].text.contains("• Channel a (Server s1) - offline for 4m 10s"));
        assert!(messages[1].text.contains("*1 channel(s) recovered:*"));

        assert!(build_messages(&[], &ctx(), now()).is_empty());
    }

    #[test]
    fn test_custom_template_and_timezone() {
        let mut ctx = ctx();
        ctx.timezone = chrono_tz::America::Sao_Paulo;
        ctx.down_template = Some("{total} down at {time} on {date}:\n{channel_list}".to_string());

        let events = vec![ChannelEvent::Down { channel: channel("a", "s1"), down_since: now() }];
        let messages = build_messages(&events, &ctx, now());
        assert_eq!(
            messages[0].text,
            "1 down at 12:30:00 on 04/07/2024:\n• Channel a (Server s1) - down since 12:30:00"
        );
    }

    #[test]
    fn test_placeholders_in_names_stay_literal() {
        let mut named = channel("a", "s1");
        named.channel_name = "Promo {time} {total}".to_string();
        let events = vec![ChannelEvent::Down { channel: named, down_since: now() }];

        let messages = build_messages(&events, &ctx(), now());
        assert!(messages[0].text.contains("• Promo {time} {total} (Server s1)"));
        assert!(messages[0].text.contains("*1 channel(s) down:*"));
    }
}
