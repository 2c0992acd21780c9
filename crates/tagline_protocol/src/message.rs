#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use crate::framing::{FramingError, MAX_TAG_SECTION_LEN};

/// Message tags, ordered so encoding is deterministic.
pub type Tags = BTreeMap<String, String>;

/// One protocol line: tags, source, command and parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
	pub tags: Tags,
	pub source: String,
	pub command: String,
	pub params: Vec<String>,
}

impl Message {
	pub fn new<I, P>(tags: Option<Tags>, source: impl Into<String>, command: impl Into<String>, params: I) -> Self
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		Self {
			tags: tags.unwrap_or_default(),
			source: source.into(),
			command: command.into(),
			params: params.into_iter().map(Into::into).collect(),
		}
	}

	pub fn get_tag(&self, name: &str) -> Option<&str> {
		self.tags.get(name).map(String::as_str)
	}

	pub fn has_tag(&self, name: &str) -> bool {
		self.tags.contains_key(name)
	}

	pub fn set_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
		self.tags.insert(name.into(), value.into());
	}

	pub fn remove_tag(&mut self, name: &str) -> Option<String> {
		self.tags.remove(name)
	}

	/// Merge `tags` into this message, overwriting existing keys.
	pub fn update_tags(&mut self, tags: &Tags) {
		for (k, v) in tags {
			self.tags.insert(k.clone(), v.clone());
		}
	}

	/// Encode without the trailing CRLF.
	///
	/// `max_len` bounds everything after the tag section, CRLF included.
	pub fn to_line(&self, max_len: usize) -> Result<String, FramingError> {
		if self.command.is_empty() {
			return Err(FramingError::Malformed("empty command".to_string()));
		}
		if self.command.contains([' ', '\r', '\n', '\0']) {
			return Err(FramingError::InvalidParam(self.command.clone()));
		}

		let mut out = String::new();
		if !self.tags.is_empty() {
			out.push('@');
			for (i, (k, v)) in self.tags.iter().enumerate() {
				if i > 0 {
					out.push(';');
				}
				out.push_str(k);
				if !v.is_empty() {
					out.push('=');
					escape_tag_value_into(&mut out, v);
				}
			}

			if out.len() > MAX_TAG_SECTION_LEN {
				return Err(FramingError::TagsTooLong {
					len: out.len(),
					max: MAX_TAG_SECTION_LEN,
				});
			}
			out.push(' ');
		}

		let body_start = out.len();
		if !self.source.is_empty() {
			out.push(':');
			out.push_str(&self.source);
			out.push(' ');
		}
		out.push_str(&self.command);

		let last = self.params.len().saturating_sub(1);
		for (i, param) in self.params.iter().enumerate() {
			if param.contains(['\r', '\n', '\0']) {
				return Err(FramingError::InvalidParam(param.clone()));
			}

			let needs_trailing = param.is_empty() || param.contains(' ') || param.starts_with(':');
			out.push(' ');
			if needs_trailing {
				if i != last {
					return Err(FramingError::InvalidParam(param.clone()));
				}
				out.push(':');
			}
			out.push_str(param);
		}

		let body_len = out.len() - body_start + 2;
		if body_len > max_len {
			return Err(FramingError::LineTooLong {
				len: body_len,
				max: max_len,
			});
		}

		Ok(out)
	}

	/// Parse a single line (CRLF already stripped).
	pub fn parse(line: &str) -> Result<Self, FramingError> {
		let mut rest = line.trim_end_matches(['\r', '\n']);
		let mut msg = Message::default();

		if let Some(stripped) = rest.strip_prefix('@') {
			let (tag_section, after) = stripped
				.split_once(' ')
				.ok_or_else(|| FramingError::Malformed("tags without command".to_string()))?;
			if tag_section.len() + 1 > MAX_TAG_SECTION_LEN {
				return Err(FramingError::TagsTooLong {
					len: tag_section.len() + 1,
					max: MAX_TAG_SECTION_LEN,
				});
			}

			for item in tag_section.split(';').filter(|s| !s.is_empty()) {
				match item.split_once('=') {
					Some((k, v)) => msg.tags.insert(k.to_string(), unescape_tag_value(v)),
					None => msg.tags.insert(item.to_string(), String::new()),
				};
			}
			rest = after;
		}

		rest = rest.trim_start_matches(' ');
		if let Some(stripped) = rest.strip_prefix(':') {
			let (source, after) = stripped.split_once(' ').unwrap_or((stripped, ""));
			msg.source = source.to_string();
			rest = after.trim_start_matches(' ');
		}

		let (command, mut params) = rest.split_once(' ').unwrap_or((rest, ""));
		if command.is_empty() {
			return Err(FramingError::Malformed(format!("missing command: {line:?}")));
		}
		msg.command = command.to_ascii_uppercase();

		loop {
			params = params.trim_start_matches(' ');
			if params.is_empty() {
				break;
			}
			if let Some(trailing) = params.strip_prefix(':') {
				msg.params.push(trailing.to_string());
				break;
			}
			let (param, after) = params.split_once(' ').unwrap_or((params, ""));
			msg.params.push(param.to_string());
			params = after;
		}

		Ok(msg)
	}
}

impl fmt::Display for Message {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.to_line(usize::MAX) {
			Ok(line) => f.write_str(&line),
			Err(_) => write!(f, "{} {:?}", self.command, self.params),
		}
	}
}

fn escape_tag_value_into(out: &mut String, value: &str) {
	for c in value.chars() {
		match c {
			';' => out.push_str("\\:"),
			' ' => out.push_str("\\s"),
			'\\' => out.push_str("\\\\"),
			'\r' => out.push_str("\\r"),
			'\n' => out.push_str("\\n"),
			other => out.push(other),
		}
	}
}

fn unescape_tag_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let mut chars = value.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			// lone trailing backslash is dropped
			None => {}
		}
	}
	out
}
