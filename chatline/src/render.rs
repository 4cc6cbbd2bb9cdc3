//! Plain-text rendering of conversation entries for the line-based client.

use std::fmt::Write;

use chrono::{DateTime, Local, Utc};

use chatline_proto::message::{DeliveryStatus, Direction, ParticipantId, Timestamp};

use crate::message::Message;

/// Formats `ts` in local time using a chrono format string.
///
/// Timestamps outside chrono's range, or an invalid format string, render
/// as the raw millisecond value.
#[must_use]
pub fn format_timestamp(ts: Timestamp, format: &str) -> String {
    let Some(utc) = i64::try_from(ts.as_millis())
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
    else {
        return ts.as_millis().to_string();
    };
    let mut out = String::new();
    if write!(out, "{}", utc.with_timezone(&Local).format(format)).is_err() {
        return ts.as_millis().to_string();
    }
    out
}

/// Status marker shown after an outbound message.
const fn status_marker(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => " …",
        DeliveryStatus::Confirmed => "",
        DeliveryStatus::Failed => " (failed)",
    }
}

/// Renders one entry as `[time] author: body`, with a status marker for
/// outbound messages that are not confirmed.
#[must_use]
pub fn format_message(
    message: &Message,
    local: &ParticipantId,
    peer: &ParticipantId,
    time_format: &str,
) -> String {
    let author = match message.direction {
        Direction::Outbound => local,
        Direction::Inbound => peer,
    };
    format!(
        "[{}] {}: {}{}",
        format_timestamp(message.timestamp, time_format),
        author,
        message.body,
        status_marker(message.status),
    )
}
