#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};

/// One fragment of a wrapped message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePair {
	pub message: String,
	pub msgid: String,
}

/// A message as the sender wrote it, plus the fragments to use for clients
/// that can't take it in one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitMessage {
	pub message: String,
	pub msgid: String,
	pub time: DateTime<Utc>,
	/// `None` when the message fits in a single line.
	pub wrapped: Option<Vec<MessagePair>>,
}

impl SplitMessage {
	/// An unsplit message.
	pub fn new(message: impl Into<String>, msgid: impl Into<String>, time: DateTime<Utc>) -> Self {
		Self {
			message: message.into(),
			msgid: msgid.into(),
			time,
			wrapped: None,
		}
	}

	/// Wrap `message` into fragments of at most `max_bytes`, breaking on spaces where possible.
	///
	/// Every fragment and the whole message get their own id from `msgid`.
	pub fn wrap(message: &str, max_bytes: usize, time: DateTime<Utc>, mut msgid: impl FnMut() -> String) -> Self {
		let whole_id = msgid();
		if max_bytes == 0 || message.len() <= max_bytes {
			return Self::new(message, whole_id, time);
		}

		let wrapped = wrap_words(message, max_bytes)
			.into_iter()
			.map(|fragment| MessagePair {
				message: fragment,
				msgid: msgid(),
			})
			.collect();

		Self {
			message: message.to_string(),
			msgid: whole_id,
			time,
			wrapped: Some(wrapped),
		}
	}

	pub fn is_split(&self) -> bool {
		self.wrapped.is_some()
	}
}

fn wrap_words(message: &str, max_bytes: usize) -> Vec<String> {
	let mut fragments = Vec::new();
	let mut current = String::new();
	let mut started = false;

	for word in message.split(' ') {
		let sep = usize::from(started);
		if current.len() + sep + word.len() <= max_bytes {
			if started {
				current.push(' ');
			}
			current.push_str(word);
			started = true;
			continue;
		}

		if started {
			fragments.push(std::mem::take(&mut current));
		}

		let mut rest = word;
		while rest.len() > max_bytes {
			let cut = floor_char_boundary(rest, max_bytes);
			fragments.push(rest[..cut].to_string());
			rest = &rest[cut..];
		}
		current.push_str(rest);
		started = true;
	}

	if started && (!current.is_empty() || fragments.is_empty()) {
		fragments.push(current);
	}

	fragments
}

/// Largest char boundary <= `max`, but always at least one char.
fn floor_char_boundary(s: &str, max: usize) -> usize {
	let mut i = max.min(s.len());
	while i > 0 && !s.is_char_boundary(i) {
		i -= 1;
	}
	if i == 0 {
		s.chars().next().map(char::len_utf8).unwrap_or(s.len())
	} else {
		i
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn counter() -> impl FnMut() -> String {
		let mut n = 0;
		move || {
			n += 1;
			format!("id{n}")
		}
	}

	#[test]
	fn short_message_is_not_split() {
		let m = SplitMessage::wrap("hello", 10, Utc::now(), counter());
		assert!(!m.is_split());
		assert_eq!(m.msgid, "id1");
		assert_eq!(m.message, "hello");
	}

	#[test]
	fn wraps_on_spaces_with_fresh_ids() {
		let m = SplitMessage::wrap("aaa bbb ccc ddd", 7, Utc::now(), counter());
		let wrapped = m.wrapped.expect("split");
		let texts: Vec<_> = wrapped.iter().map(|p| p.message.as_str()).collect();
		assert_eq!(texts, vec!["aaa bbb", "ccc ddd"]);
		assert_eq!(wrapped[0].msgid, "id2");
		assert_eq!(wrapped[1].msgid, "id3");
		assert_eq!(m.msgid, "id1");
	}

	#[test]
	fn long_words_are_cut_on_char_boundaries() {
		let m = SplitMessage::wrap("ééééé", 3, Utc::now(), counter());
		let wrapped = m.wrapped.expect("split");
		assert!(wrapped.iter().all(|p| p.message.len() <= 3));
		let joined: String = wrapped.iter().map(|p| p.message.as_str()).collect();
		assert_eq!(joined, "ééééé");
	}
}
