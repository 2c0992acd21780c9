#![forbid(unsafe_code)]

//! Outbound message buffering for one client session.
//!
//! A `ResponseBuffer` collects everything one unit of work (usually one incoming
//! command) wants to say to a session, then releases it. With labeled-response the
//! buffer picks the framing on its own: a bare `ACK` when there is nothing to say, the
//! label on the single reply, or a `draft/labeled-response` batch around two or more
//! replies. Nested batches (history playback) are tracked independently of that
//! top-level batch and are never re-tagged by it.

use std::backtrace::Backtrace;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tagline_domain::Capability;
use tagline_protocol::commands::{ACK, BATCH, NOTICE};
use tagline_protocol::tags::{ACCOUNT_TAG, BATCH_TAG, LABEL_TAG, MSGID_TAG};
use tagline_protocol::{Message, SplitMessage, Tags};
use tagline_util::token::secret_token;
use thiserror::Error;
use tracing::{debug, error};

use crate::server::client::Client;
use crate::server::session::{SendError, Session};

/// Batch type used when a labeled reply needs a batch.
pub const DEFAULT_BATCH_TYPE: &str = "draft/labeled-response";

/// Nested batch type for clients with event-playback.
pub const HISTORY_BATCH_TYPE: &str = "history";

/// Nested batch type for clients with plain batch support.
pub const CHATHISTORY_BATCH_TYPE: &str = "chathistory";

#[derive(Debug, Error)]
pub enum ResponseBufferError {
	#[error("message added to finalized response buffer")]
	Finalized,

	#[error("inconsistent batch nesting: closing {batch_id:?}, innermost open batch is {innermost:?}")]
	BatchNesting {
		batch_id: String,
		innermost: Option<String>,
	},

	#[error("transmission failed: {0}")]
	Send(#[from] SendError),
}

pub struct ResponseBuffer {
	label: String,
	batch_id: Option<String>,
	batch_type: String,

	/// Open nested batches, innermost last. Messages added while one is open carry its id.
	nested_batches: Vec<String>,

	messages: Vec<Message>,
	finalized: bool,
	target: Arc<Client>,
	session: Arc<Session>,
}

impl ResponseBuffer {
	/// `label` may be empty when the request carried none.
	pub fn new(target: Arc<Client>, session: Arc<Session>, label: impl Into<String>) -> Self {
		Self {
			label: label.into(),
			batch_id: None,
			batch_type: DEFAULT_BATCH_TYPE.to_string(),
			nested_batches: Vec::new(),
			messages: Vec::new(),
			finalized: false,
			target,
			session,
		}
	}

	/// The label of `msg`, or `""`.
	pub fn get_label(msg: &Message) -> &str {
		msg.get_tag(LABEL_TAG).unwrap_or("")
	}

	#[allow(dead_code)]
	pub fn label(&self) -> &str {
		&self.label
	}

	#[allow(dead_code)]
	pub fn batch_id(&self) -> Option<&str> {
		self.batch_id.as_deref()
	}

	#[allow(dead_code)]
	pub fn batch_type(&self) -> &str {
		&self.batch_type
	}

	#[allow(dead_code)]
	pub fn nested_depth(&self) -> usize {
		self.nested_batches.len()
	}

	#[allow(dead_code)]
	pub fn len(&self) -> usize {
		self.messages.len()
	}

	#[allow(dead_code)]
	pub fn is_empty(&self) -> bool {
		self.messages.is_empty()
	}

	#[allow(dead_code)]
	pub fn is_finalized(&self) -> bool {
		self.finalized
	}

	fn server_name(&self) -> String {
		self.target.server().name().to_string()
	}

	pub fn add_message(&mut self, mut msg: Message) -> Result<(), ResponseBufferError> {
		if self.finalized {
			self.report_internal_error("message added to finalized response buffer", &msg.command);
			return Err(ResponseBufferError::Finalized);
		}

		if let Some(batch_id) = self.nested_batches.last() {
			msg.set_tag(BATCH_TAG, batch_id.clone());
		}
		self.messages.push(msg);
		Ok(())
	}

	pub fn add<I, P>(&mut self, tags: Option<Tags>, source: &str, command: &str, params: I) -> Result<(), ResponseBufferError>
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		self.add_message(Message::new(tags, source, command, params))
	}

	/// Queue the message here and send an unlabeled copy to the target's other sessions.
	pub fn broadcast<I, P>(
		&mut self,
		tags: Option<Tags>,
		source: &str,
		command: &str,
		params: I,
	) -> Result<(), ResponseBufferError>
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		let params: Vec<String> = params.into_iter().map(Into::into).collect();
		let queued = self.add(tags.clone(), source, command, params.clone());

		for session in self.target.sessions() {
			if session.id() == self.session.id() {
				continue;
			}
			if let Err(e) = session.send(tags.clone(), source, command, params.clone()) {
				debug!(session_id = session.id(), error = %e, "broadcast copy not delivered");
			}
		}

		queued
	}

	/// Queue a message sent by another user, tagged according to what this session supports.
	#[allow(clippy::too_many_arguments)]
	pub fn add_from_client<I, P>(
		&mut self,
		time: Option<DateTime<Utc>>,
		msgid: &str,
		source_mask: &str,
		source_account: &str,
		tags: Option<&Tags>,
		command: &str,
		params: I,
	) -> Result<(), ResponseBufferError>
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		let mut msg = Message::new(None, source_mask, command, params);
		let caps = self.session.capabilities();

		if caps.has(Capability::MessageTags)
			&& let Some(tags) = tags
		{
			msg.update_tags(tags);
		}
		if caps.has(Capability::AccountTag) && source_account != "*" {
			msg.set_tag(ACCOUNT_TAG, source_account);
		}
		if !msgid.is_empty() && caps.has(Capability::MessageTags) {
			msg.set_tag(MSGID_TAG, msgid);
		}
		self.session.set_time_tag(&mut msg, time);

		self.add_message(msg)
	}

	/// Queue a possibly-wrapped message; fragments are only used when the session lacks maxline.
	pub fn add_split_message_from_client(
		&mut self,
		source_mask: &str,
		source_account: &str,
		tags: Option<&Tags>,
		command: &str,
		target: &str,
		message: &SplitMessage,
	) -> Result<(), ResponseBufferError> {
		let wrapped = match &message.wrapped {
			Some(wrapped) if !self.session.has(Capability::MaxLine) => wrapped,
			_ => {
				return self.add_from_client(
					Some(message.time),
					&message.msgid,
					source_mask,
					source_account,
					tags,
					command,
					[target, message.message.as_str()],
				);
			}
		};

		for pair in wrapped {
			self.add_from_client(
				Some(message.time),
				&pair.msgid,
				source_mask,
				source_account,
				tags,
				command,
				[target, pair.message.as_str()],
			)?;
		}
		Ok(())
	}

	/// Open a top-level batch of `batch_type`, even if nothing ends up inside it.
	#[allow(dead_code)]
	pub async fn force_batch_start(&mut self, batch_type: &str, blocking: bool) -> Result<(), ResponseBufferError> {
		self.batch_type = batch_type.to_string();
		self.send_batch_start(blocking).await.map_err(Into::into)
	}

	async fn send_batch_start(&mut self, blocking: bool) -> Result<(), SendError> {
		if self.batch_id.is_some() {
			return Ok(());
		}

		let batch_id = secret_token();
		let mut message = Message::new(
			None,
			self.server_name(),
			BATCH,
			[format!("+{batch_id}"), self.batch_type.clone()],
		);
		if !self.label.is_empty() {
			message.set_tag(LABEL_TAG, self.label.clone());
		}
		self.batch_id = Some(batch_id);

		metrics::counter!("tagline_server_batches_total").increment(1);
		self.session.send_raw_message(message, blocking).await
	}

	async fn send_batch_end(&mut self, blocking: bool) -> Result<(), SendError> {
		let Some(batch_id) = &self.batch_id else {
			return Ok(());
		};

		let message = Message::new(None, self.server_name(), BATCH, [format!("-{batch_id}")]);
		self.session.send_raw_message(message, blocking).await
	}

	/// Open a nested batch and queue its start line now. Returns the batch id.
	pub fn start_nested_batch<I, P>(&mut self, batch_type: &str, params: I) -> Result<String, ResponseBufferError>
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		let batch_id = secret_token();
		let mut msg_params = vec![format!("+{batch_id}"), batch_type.to_string()];
		msg_params.extend(params.into_iter().map(Into::into));

		let source = self.server_name();
		self.add(None, &source, BATCH, msg_params)?;
		self.nested_batches.push(batch_id.clone());
		Ok(batch_id)
	}

	/// Close the innermost nested batch. An empty id is a no-op.
	pub fn end_nested_batch(&mut self, batch_id: &str) -> Result<(), ResponseBufferError> {
		if batch_id.is_empty() {
			return Ok(());
		}

		if self.nested_batches.last().map(String::as_str) != Some(batch_id) {
			self.report_internal_error("inconsistent batch nesting detected", batch_id);
			return Err(ResponseBufferError::BatchNesting {
				batch_id: batch_id.to_string(),
				innermost: self.nested_batches.last().cloned(),
			});
		}
		self.nested_batches.pop();
		let source = self.server_name();
		self.add(None, &source, BATCH, [format!("-{batch_id}")])
	}

	/// Open the richest history batch the session understands, if any.
	pub fn start_nested_history_batch<I, P>(&mut self, params: I) -> Result<Option<String>, ResponseBufferError>
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		let batch_type = if self.session.has(Capability::EventPlayback) {
			HISTORY_BATCH_TYPE
		} else if self.session.has(Capability::Batch) {
			CHATHISTORY_BATCH_TYPE
		} else {
			return Ok(None);
		};

		self.start_nested_batch(batch_type, params).map(Some)
	}

	/// Release everything and finish the buffer. It must not be used afterwards.
	///
	/// `blocking` may only be true when running on the session's own handling path.
	pub async fn send(&mut self, blocking: bool) -> Result<(), ResponseBufferError> {
		self.flush_internal(true, blocking).await
	}

	/// Release what is queued so far but keep the buffer open. A later `send` is still
	/// required to close any batch opened here.
	pub async fn flush(&mut self, blocking: bool) -> Result<(), ResponseBufferError> {
		self.flush_internal(false, blocking).await
	}

	async fn flush_internal(&mut self, is_final: bool, blocking: bool) -> Result<(), ResponseBufferError> {
		if self.finalized {
			return Ok(());
		}

		let use_label = !self.label.is_empty() && self.session.has(Capability::LabeledResponse);
		// A flush that isn't final has to assume more messages are coming.
		let start_batch = use_label && (self.messages.len() > 1 || !is_final);

		let mut first_err = None;

		if start_batch {
			keep_first(&mut first_err, self.send_batch_start(blocking).await);
		} else if use_label && self.messages.is_empty() && self.batch_id.is_none() && is_final {
			let mut ack = Message::new(None, self.server_name(), ACK, Vec::<String>::new());
			ack.set_tag(LABEL_TAG, self.label.clone());
			self.session.set_time_tag(&mut ack, None);

			metrics::counter!("tagline_server_labeled_acks_total").increment(1);
			keep_first(&mut first_err, self.session.send_raw_message(ack, blocking).await);
		} else if use_label && self.messages.len() == 1 && self.batch_id.is_none() && is_final {
			self.messages[0].set_tag(LABEL_TAG, self.label.clone());
		}

		for mut message in self.messages.drain(..) {
			self.session.set_time_tag(&mut message, None);

			// nested batch members keep their own batch tag
			if let Some(batch_id) = &self.batch_id
				&& !message.has_tag(BATCH_TAG)
			{
				message.set_tag(BATCH_TAG, batch_id.clone());
			}

			keep_first(&mut first_err, self.session.send_raw_message(message, blocking).await);
		}

		if is_final {
			keep_first(&mut first_err, self.send_batch_end(blocking).await);
			self.finalized = true;
		}

		match first_err {
			Some(e) => Err(e.into()),
			None => Ok(()),
		}
	}

	/// Notice from the server to the target client.
	#[allow(dead_code)]
	pub fn notice(&mut self, text: &str) -> Result<(), ResponseBufferError> {
		let source = self.server_name();
		let nick = self.target.nick();
		self.add(None, &source, NOTICE, [nick.as_str(), text])
	}

	fn report_internal_error(&self, what: &str, detail: &str) {
		metrics::counter!("tagline_server_internal_errors_total").increment(1);
		let backtrace = Backtrace::force_capture();
		error!(
			session_id = self.session.id(),
			detail,
			%backtrace,
			"internal error: {what}"
		);
	}
}

fn keep_first(slot: &mut Option<SendError>, result: Result<(), SendError>) {
	if let Err(e) = result
		&& slot.is_none()
	{
		*slot = Some(e);
	}
}
