#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::message::Message;

/// Default maximum line length (body + CRLF, tags excluded).
pub const DEFAULT_MAX_LINE_LEN: usize = 512;

/// Maximum length of the `@tags ` section.
pub const MAX_TAG_SECTION_LEN: usize = 8191;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("line exceeds maximum length: len={len} max={max}")]
	LineTooLong {
		len: usize,
		max: usize,
	},

	#[error("tag section exceeds maximum length: len={len} max={max}")]
	TagsTooLong {
		len: usize,
		max: usize,
	},

	#[error("malformed line: {0}")]
	Malformed(String),

	#[error("invalid parameter: {0:?}")]
	InvalidParam(String),
}

/// Append an encoded `line\r\n` into the provided buffer.
pub fn encode_line_into(buf: &mut BytesMut, msg: &Message, max_len: usize) -> Result<usize, FramingError> {
	let line = msg.to_line(max_len)?;
	buf.reserve(line.len() + 2);
	buf.put_slice(line.as_bytes());
	buf.put_slice(b"\r\n");
	Ok(line.len() + 2)
}

/// Try to decode a single line from a growable buffer.
///
/// Blank lines are consumed and skipped. `max_len` bounds the body; the tag section
/// gets its own `MAX_TAG_SECTION_LEN` allowance on top.
pub fn try_decode_line_from_buffer(buf: &mut BytesMut, max_len: usize) -> Result<Option<Message>, FramingError> {
	let limit = max_len.saturating_add(MAX_TAG_SECTION_LEN);

	loop {
		let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
			if buf.len() > limit {
				return Err(FramingError::LineTooLong { len: buf.len(), max: limit });
			}
			return Ok(None);
		};

		let frame = buf.split_to(pos);
		buf.advance(1);

		let mut raw = &frame[..];
		if let [rest @ .., b'\r'] = raw {
			raw = rest;
		}
		if raw.is_empty() {
			continue;
		}
		if raw.len() + 2 > limit {
			return Err(FramingError::LineTooLong {
				len: raw.len() + 2,
				max: limit,
			});
		}

		let line = std::str::from_utf8(raw).map_err(|e| FramingError::Malformed(format!("invalid utf-8: {e}")))?;
		return Message::parse(line).map(Some);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_appends_crlf() {
		let msg = Message::new(None, "srv", "PONG", ["srv", "tok"]);
		let mut buf = BytesMut::new();
		let n = encode_line_into(&mut buf, &msg, DEFAULT_MAX_LINE_LEN).expect("encode");
		assert_eq!(&buf[..], b":srv PONG srv tok\r\n");
		assert_eq!(n, buf.len());
	}

	#[test]
	fn try_decode_from_buffer_incremental() {
		let mut buf = BytesMut::new();

		buf.extend_from_slice(b"PING ");
		assert!(
			try_decode_line_from_buffer(&mut buf, DEFAULT_MAX_LINE_LEN)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(b"abc\r\nNICK a");
		let decoded = try_decode_line_from_buffer(&mut buf, DEFAULT_MAX_LINE_LEN)
			.expect("ok")
			.expect("some");
		assert_eq!(decoded.command, "PING");
		assert_eq!(decoded.params, vec!["abc".to_string()]);
		assert_eq!(&buf[..], b"NICK a");
	}

	#[test]
	fn skips_blank_lines_and_bare_lf() {
		let mut buf = BytesMut::from(&b"\r\n\nQUIT\n"[..]);
		let decoded = try_decode_line_from_buffer(&mut buf, DEFAULT_MAX_LINE_LEN)
			.expect("ok")
			.expect("some");
		assert_eq!(decoded.command, "QUIT");
		assert!(buf.is_empty());
	}

	#[test]
	fn rejects_unterminated_over_long_line() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&vec![b'a'; DEFAULT_MAX_LINE_LEN + MAX_TAG_SECTION_LEN + 1]);

		let err = try_decode_line_from_buffer(&mut buf, DEFAULT_MAX_LINE_LEN).unwrap_err();
		match err {
			FramingError::LineTooLong { .. } => {}
			other => panic!("unexpected error: {other:?}"),
		}
	}
}
