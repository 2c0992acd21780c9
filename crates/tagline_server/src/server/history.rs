#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tagline_domain::casefold;
use tagline_protocol::SplitMessage;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
	pub per_conversation_capacity: usize,
}

impl Default for HistoryConfig {
	fn default() -> Self {
		Self {
			per_conversation_capacity: 128,
		}
	}
}

/// One delivered PRIVMSG/NOTICE, as it was originally stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
	pub source_mask: String,
	pub account: String,
	pub command: String,
	pub target: String,
	pub message: SplitMessage,
}

#[derive(Debug, Default)]
pub struct HistoryStore {
	buffer_by_conversation: HashMap<String, VecDeque<HistoryItem>>,
}

impl HistoryStore {
	pub fn push(&mut self, conversation: &str, item: HistoryItem, cfg: &HistoryConfig) {
		if cfg.per_conversation_capacity == 0 {
			return;
		}

		let buf = self.buffer_by_conversation.entry(conversation.to_string()).or_default();
		buf.push_back(item);
		while buf.len() > cfg.per_conversation_capacity {
			buf.pop_front();
		}
	}

	/// Up to `limit` most recent items, oldest first.
	pub fn latest(&self, conversation: &str, limit: usize) -> Vec<HistoryItem> {
		let Some(buf) = self.buffer_by_conversation.get(conversation) else {
			return Vec::new();
		};

		let skip = buf.len().saturating_sub(limit);
		buf.iter().skip(skip).cloned().collect()
	}
}

/// Thread-safe history shared by every connection.
#[derive(Debug)]
pub struct History {
	cfg: HistoryConfig,
	store: Mutex<HistoryStore>,
}

impl History {
	pub fn new(cfg: HistoryConfig) -> Self {
		Self {
			cfg,
			store: Mutex::new(HistoryStore::default()),
		}
	}

	pub fn capacity(&self) -> usize {
		self.cfg.per_conversation_capacity
	}

	pub fn push(&self, conversation: &str, item: HistoryItem) {
		self.store.lock().push(conversation, item, &self.cfg);
	}

	pub fn latest(&self, conversation: &str, limit: usize) -> Vec<HistoryItem> {
		self.store.lock().latest(conversation, limit)
	}
}

/// Key for a direct conversation, independent of who is asking.
pub fn conversation_key(a: &str, b: &str) -> String {
	let (a, b) = (casefold(a), casefold(b));
	if a <= b { format!("{a}\u{0}{b}") } else { format!("{b}\u{0}{a}") }
}
