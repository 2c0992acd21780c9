#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};

/// IRCv3 `server-time` format, millisecond precision, always UTC.
pub const SERVER_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[inline]
pub fn format_server_time(t: DateTime<Utc>) -> String {
	t.format(SERVER_TIME_FORMAT).to_string()
}
