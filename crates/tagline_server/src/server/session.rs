#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tagline_domain::{Capability, CapabilitySet};
use tagline_protocol::tags::TIME_TAG;
use tagline_protocol::{Message, Tags};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::util::time::format_server_time;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
	#[error("outbound queue full")]
	QueueFull,

	#[error("session closed")]
	Closed,
}

/// One network connection's sending path.
///
/// Messages are queued to a writer task that owns the socket; the session itself never
/// touches I/O.
#[derive(Debug)]
pub struct Session {
	id: u64,
	capabilities: RwLock<CapabilitySet>,
	outbound: mpsc::Sender<Message>,
	server_time: bool,
}

impl Session {
	pub fn new(id: u64, capabilities: CapabilitySet, outbound: mpsc::Sender<Message>, server_time: bool) -> Self {
		Self {
			id,
			capabilities: RwLock::new(capabilities),
			outbound,
			server_time,
		}
	}

	/// Session wired to a fresh bounded queue; the caller drains the receiver.
	#[allow(dead_code)]
	pub fn detached(id: u64, capabilities: CapabilitySet, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
		let (tx, rx) = mpsc::channel(capacity.max(1));
		(Self::new(id, capabilities, tx, true), rx)
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn capabilities(&self) -> CapabilitySet {
		*self.capabilities.read()
	}

	#[inline]
	pub fn has(&self, cap: Capability) -> bool {
		self.capabilities.read().has(cap)
	}

	pub fn update_capabilities(&self, f: impl FnOnce(&mut CapabilitySet)) {
		f(&mut self.capabilities.write());
	}

	#[allow(dead_code)]
	pub fn is_closed(&self) -> bool {
		self.outbound.is_closed()
	}

	/// Attach `time` unless the session didn't negotiate server-time or the message already has one.
	///
	/// `None` means "now". A server with server-time disabled never attaches the tag.
	pub fn set_time_tag(&self, msg: &mut Message, time: Option<DateTime<Utc>>) {
		if !self.server_time || !self.has(Capability::ServerTime) || msg.has_tag(TIME_TAG) {
			return;
		}
		msg.set_tag(TIME_TAG, format_server_time(time.unwrap_or_else(Utc::now)));
	}

	/// Queue `msg` for the writer task.
	///
	/// `blocking` may only be true on this session's own handling path: it waits for
	/// queue capacity. Otherwise a full queue drops the message.
	pub async fn send_raw_message(&self, msg: Message, blocking: bool) -> Result<(), SendError> {
		if !blocking {
			return self.try_send_raw_message(msg);
		}

		self.outbound.send(msg).await.map_err(|_| SendError::Closed)
	}

	pub fn try_send_raw_message(&self, msg: Message) -> Result<(), SendError> {
		match self.outbound.try_send(msg) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(msg)) => {
				metrics::counter!("tagline_server_send_dropped_total").increment(1);
				debug!(session_id = self.id, command = %msg.command, "outbound queue full; dropping message");
				Err(SendError::QueueFull)
			}
			Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
		}
	}

	/// Build a message, stamp it and queue it without waiting.
	pub fn send<I, P>(&self, tags: Option<Tags>, source: &str, command: &str, params: I) -> Result<(), SendError>
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		let mut msg = Message::new(tags, source, command, params);
		self.set_time_tag(&mut msg, None);
		self.try_send_raw_message(msg)
	}
}
