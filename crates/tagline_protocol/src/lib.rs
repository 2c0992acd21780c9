#![forbid(unsafe_code)]

pub mod framing;
pub mod message;
pub mod split;

pub use framing::{
	DEFAULT_MAX_LINE_LEN, FramingError, MAX_TAG_SECTION_LEN, encode_line_into, try_decode_line_from_buffer,
};
pub use message::{Message, Tags};
pub use split::{MessagePair, SplitMessage};

/// Well-known message tag names.
pub mod tags {
	/// Request correlation (labeled-response).
	pub const LABEL_TAG: &str = "label";
	/// Batch membership.
	pub const BATCH_TAG: &str = "batch";
	pub const MSGID_TAG: &str = "msgid";
	pub const ACCOUNT_TAG: &str = "account";
	/// Server-time.
	pub const TIME_TAG: &str = "time";
}

/// Command names the buffer emits on its own.
pub mod commands {
	pub const BATCH: &str = "BATCH";
	pub const ACK: &str = "ACK";
	pub const NOTICE: &str = "NOTICE";
	pub const PRIVMSG: &str = "PRIVMSG";
}
