#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use bytes::{Buf, BytesMut};
use chrono::Utc;
use tagline_domain::{Capability, CapabilitySet, Nickname};
use tagline_protocol::commands::{NOTICE, PRIVMSG};
use tagline_protocol::{
	FramingError, MAX_TAG_SECTION_LEN, Message, SplitMessage, Tags, encode_line_into, try_decode_line_from_buffer,
};
use tagline_util::token::secret_token;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::{parse_pass, verify_password};
use crate::server::client::Client;
use crate::server::health::HealthState;
use crate::server::history::{HistoryItem, conversation_key};
use crate::server::response_buffer::{ResponseBuffer, ResponseBufferError};
use crate::server::session::Session;
use crate::server::state::ServerContext;

/// History replay flushes this often so a long playback doesn't sit in one buffer.
const HISTORY_FLUSH_EVERY: usize = 64;

/// How long the writer gets to drain after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>, health: HealthState) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, peer) = listener.accept().await.context("accept tcp connection")?;

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("tagline_server_connections_total").increment(1);

		let ctx = Arc::clone(&ctx);
		let health = health.clone();
		tokio::spawn(async move {
			info!(conn_id, remote = %peer, "accepted connection");
			if let Err(e) = handle_connection(conn_id, stream, peer, ctx, health).await {
				warn!(conn_id, error = %e, "connection handler exited with error");
			}
		});
	}
}

pub async fn handle_connection(
	conn_id: u64,
	stream: TcpStream,
	peer: SocketAddr,
	ctx: Arc<ServerContext>,
	health: HealthState,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard(HealthState);
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("tagline_server_active_connections").decrement(1.0);
			self.0.session_closed();
		}
	}

	metrics::gauge!("tagline_server_active_connections").increment(1.0);
	health.session_opened();
	let _conn_guard = ConnectionGaugeGuard(health);

	let _ = stream.set_nodelay(true);
	let (mut read_half, write_half) = stream.into_split();

	let (tx, rx) = mpsc::channel::<Message>(ctx.settings.outbound_queue_capacity.max(1));
	let session = Arc::new(Session::new(conn_id, CapabilitySet::new(), tx, ctx.settings.server_time));

	let writer = tokio::spawn(run_writer(
		conn_id,
		write_half,
		rx,
		Arc::downgrade(&session),
		ctx.settings.max_line_len,
		ctx.settings.max_line_len_long,
	));

	let provisional = ctx.new_client(&peer.ip().to_string(), None);
	provisional.attach_session(Arc::clone(&session));

	let mut conn = ConnectionState {
		conn_id,
		host: peer.ip().to_string(),
		ctx: Arc::clone(&ctx),
		session,
		client: provisional,
		pass: None,
		nick: None,
		username: None,
		cap_negotiating: false,
		registered: false,
	};

	let result = read_loop(&mut conn, &mut read_half).await;

	let remaining = conn.client.detach_session(conn_id);
	if conn.registered && remaining == 0 {
		ctx.registry.remove(&conn.client);
	}
	info!(conn_id, nick = %conn.client.nick(), remaining_sessions = remaining, "connection closed");

	// The writer only holds a weak handle; dropping the last strong one closes the queue.
	drop(conn);
	match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await {
		Ok(Ok(Ok(()))) => {}
		Ok(Ok(Err(e))) => debug!(conn_id, error = %e, "writer stopped with error"),
		Ok(Err(e)) => warn!(conn_id, error = %e, "writer task failed"),
		Err(_) => debug!(conn_id, "writer did not drain in time"),
	}

	result
}

async fn read_loop(conn: &mut ConnectionState, read_half: &mut OwnedReadHalf) -> anyhow::Result<()> {
	let max_len = conn.ctx.settings.max_line_len_long;
	let limit = max_len.saturating_add(MAX_TAG_SECTION_LEN);
	let mut buf = BytesMut::with_capacity(4096);
	// Set after an unterminated overflow: the rest of that line is dropped up to its `\n`.
	let mut discarding = false;

	loop {
		loop {
			if discarding {
				match buf.iter().position(|b| *b == b'\n') {
					Some(pos) => {
						buf.advance(pos + 1);
						discarding = false;
					}
					None => {
						buf.clear();
						break;
					}
				}
			}

			match try_decode_line_from_buffer(&mut buf, max_len) {
				Ok(Some(msg)) => {
					metrics::counter!("tagline_server_lines_in_total").increment(1);
					if conn.handle_message(msg).await == Flow::Quit {
						return Ok(());
					}
				}
				Ok(None) => break,
				Err(FramingError::LineTooLong { len, max }) => {
					debug!(conn_id = conn.conn_id, len, max, "input line too long");
					if buf.len() > limit && !buf.contains(&b'\n') {
						buf.clear();
						discarding = true;
					}
					let nick = conn.client.nick();
					let server = conn.ctx.identity.name().to_string();
					let _ = conn.session.send(None, &server, "417", [nick.as_str(), "Input line was too long"]);
				}
				Err(e) => {
					debug!(conn_id = conn.conn_id, error = %e, "dropping malformed line");
				}
			}
		}

		let n = read_half.read_buf(&mut buf).await.context("read from client")?;
		if n == 0 {
			return Ok(());
		}
	}
}

/// Drains the session queue onto the socket, coalescing whatever is already queued.
async fn run_writer(
	conn_id: u64,
	mut write_half: OwnedWriteHalf,
	mut rx: mpsc::Receiver<Message>,
	session: Weak<Session>,
	max_line_len: usize,
	max_line_len_long: usize,
) -> anyhow::Result<()> {
	let mut buf = BytesMut::with_capacity(4096);

	while let Some(first) = rx.recv().await {
		let max_len = match session.upgrade() {
			Some(s) if s.has(Capability::MaxLine) => max_line_len_long,
			_ => max_line_len,
		};

		let mut next = Some(first);
		while let Some(msg) = next {
			match encode_line_into(&mut buf, &msg, max_len) {
				Ok(_) => metrics::counter!("tagline_server_lines_out_total").increment(1),
				Err(e) => warn!(conn_id, command = %msg.command, error = %e, "dropping unencodable message"),
			}
			next = rx.try_recv().ok();
		}

		write_half.write_all(&buf).await.context("write to client")?;
		buf.clear();
	}

	write_half.shutdown().await.ok();
	Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
	Continue,
	Quit,
}

struct ConnectionState {
	conn_id: u64,
	host: String,
	ctx: Arc<ServerContext>,
	session: Arc<Session>,
	client: Arc<Client>,
	/// Account verified by PASS, if any.
	pass: Option<String>,
	nick: Option<String>,
	username: Option<String>,
	cap_negotiating: bool,
	registered: bool,
}

impl ConnectionState {
	async fn handle_message(&mut self, msg: Message) -> Flow {
		let mut rb = ResponseBuffer::new(
			Arc::clone(&self.client),
			Arc::clone(&self.session),
			ResponseBuffer::get_label(&msg),
		);

		let command = msg.command.to_ascii_uppercase();
		let flow = match self.dispatch(&command, &msg, &mut rb).await {
			Ok(flow) => flow,
			Err(e) => {
				warn!(conn_id = self.conn_id, command = %command, error = %e, "command handling failed");
				Flow::Continue
			}
		};

		if let Err(e) = rb.send(true).await {
			debug!(conn_id = self.conn_id, error = %e, "response not delivered");
			return Flow::Quit;
		}
		flow
	}

	async fn dispatch(&mut self, command: &str, msg: &Message, rb: &mut ResponseBuffer) -> Result<Flow, ResponseBufferError> {
		match command {
			"CAP" => self.handle_cap(msg, rb)?,
			"PASS" => self.handle_pass(msg, rb)?,
			"NICK" => self.handle_nick(msg, rb)?,
			"USER" => self.handle_user(msg, rb)?,
			"PING" => {
				let server = self.server_name();
				let token = msg.params.first().cloned().unwrap_or_default();
				rb.add(None, &server, "PONG", [server.clone(), token])?;
			}
			"QUIT" => {
				rb.add(None, "", "ERROR", ["Closing link"])?;
				return Ok(Flow::Quit);
			}
			_ if !self.registered => self.numeric(rb, "451", ["You have not registered"])?,
			PRIVMSG | NOTICE => self.handle_message_to_user(command, msg, rb).await?,
			"CHATHISTORY" => self.handle_chathistory(msg, rb).await?,
			_ => self.numeric(rb, "421", [command, "Unknown command"])?,
		}
		Ok(Flow::Continue)
	}

	fn server_name(&self) -> String {
		self.ctx.identity.name().to_string()
	}

	fn current_nick(&self) -> String {
		if self.registered {
			self.client.nick()
		} else {
			self.nick.clone().unwrap_or_else(|| "*".to_string())
		}
	}

	fn numeric<I, P>(&self, rb: &mut ResponseBuffer, code: &str, params: I) -> Result<(), ResponseBufferError>
	where
		I: IntoIterator<Item = P>,
		P: Into<String>,
	{
		let mut all = vec![self.current_nick()];
		all.extend(params.into_iter().map(Into::into));
		rb.add(None, &self.server_name(), code, all)
	}

	fn handle_cap(&mut self, msg: &Message, rb: &mut ResponseBuffer) -> Result<(), ResponseBufferError> {
		let server = self.server_name();
		let nick = self.current_nick();
		let sub = msg.params.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();

		match sub.as_str() {
			"LS" => {
				if !self.registered {
					self.cap_negotiating = true;
				}
				rb.add(None, &server, "CAP", [nick, "LS".to_string(), CapabilitySet::all().to_string()])
			}
			"LIST" => {
				let enabled = self.session.capabilities().to_string();
				rb.add(None, &server, "CAP", [nick, "LIST".to_string(), enabled])
			}
			"REQ" => {
				if !self.registered {
					self.cap_negotiating = true;
				}
				let requested = msg.params.get(1).cloned().unwrap_or_default();
				match parse_cap_request(&requested) {
					Some(changes) => {
						self.session.update_capabilities(|caps| {
							for (cap, enable) in changes {
								if enable {
									caps.enable(cap);
								} else {
									caps.disable(cap);
								}
							}
						});
						debug!(conn_id = self.conn_id, caps = %self.session.capabilities(), "capabilities updated");
						rb.add(None, &server, "CAP", [nick, "ACK".to_string(), requested])
					}
					None => rb.add(None, &server, "CAP", [nick, "NAK".to_string(), requested]),
				}
			}
			"END" => {
				self.cap_negotiating = false;
				self.try_register(rb)
			}
			_ => self.numeric(rb, "410", [sub.as_str(), "Invalid CAP command"]),
		}
	}

	fn handle_pass(&mut self, msg: &Message, rb: &mut ResponseBuffer) -> Result<(), ResponseBufferError> {
		if self.registered {
			return self.numeric(rb, "462", ["You may not reregister"]);
		}
		let Some(param) = msg.params.first() else {
			return self.numeric(rb, "461", ["PASS", "Not enough parameters"]);
		};

		let creds = match parse_pass(param) {
			Ok(creds) => creds,
			Err(e) => {
				debug!(conn_id = self.conn_id, error = %e, "rejecting PASS");
				return self.numeric(rb, "464", ["Password incorrect"]);
			}
		};

		let verified = self
			.ctx
			.account_password_hash(&creds.account)
			.is_some_and(|hash| verify_password(&creds.password, hash));
		if !verified {
			warn!(conn_id = self.conn_id, account = %creds.account, "PASS rejected");
			return self.numeric(rb, "464", ["Password incorrect"]);
		}

		info!(conn_id = self.conn_id, account = %creds.account, "account authenticated");
		self.pass = Some(creds.account);
		Ok(())
	}

	fn handle_nick(&mut self, msg: &Message, rb: &mut ResponseBuffer) -> Result<(), ResponseBufferError> {
		let Some(requested) = msg.params.first() else {
			return self.numeric(rb, "431", ["No nickname given"]);
		};
		let nick = match Nickname::new(requested.as_str()) {
			Ok(nick) => nick,
			Err(e) => {
				debug!(conn_id = self.conn_id, error = %e, "rejecting nickname");
				return self.numeric(rb, "432", [requested.as_str(), "Erroneous nickname"]);
			}
		};

		if !self.registered {
			if !self.ctx.registry.is_nick_available(nick.as_str(), self.client.id()) {
				return self.numeric(rb, "433", [nick.as_str(), "Nickname is already in use"]);
			}
			self.nick = Some(nick.as_str().to_string());
			return self.try_register(rb);
		}

		let old_mask = self.client.nick_mask();
		if self.ctx.registry.rename(&self.client, nick.as_str()).is_err() {
			return self.numeric(rb, "433", [nick.as_str(), "Nickname is already in use"]);
		}
		rb.broadcast(None, &old_mask, "NICK", [nick.as_str()])
	}

	fn handle_user(&mut self, msg: &Message, rb: &mut ResponseBuffer) -> Result<(), ResponseBufferError> {
		if self.registered {
			return self.numeric(rb, "462", ["You may not reregister"]);
		}
		if msg.params.len() < 4 {
			return self.numeric(rb, "461", ["USER", "Not enough parameters"]);
		}
		self.username = Some(msg.params[0].clone());
		self.try_register(rb)
	}

	fn try_register(&mut self, rb: &mut ResponseBuffer) -> Result<(), ResponseBufferError> {
		if self.registered || self.cap_negotiating {
			return Ok(());
		}
		let (Some(nick), Some(username)) = (self.nick.clone(), self.username.clone()) else {
			return Ok(());
		};

		if let Some(account) = self.pass.as_deref()
			&& let Some(existing) = self.ctx.registry.find_by_account(account)
		{
			existing.attach_session(Arc::clone(&self.session));
			self.client.detach_session(self.conn_id);
			self.client = existing;
			self.registered = true;

			let count = self.client.sessions().len();
			info!(conn_id = self.conn_id, account, sessions = count, "attached to existing client");
			self.welcome(rb)?;
			let server = self.server_name();
			let nick = self.client.nick();
			return rb.add(
				None,
				&server,
				NOTICE,
				[nick, format!("Attached to existing client ({count} sessions)")],
			);
		}

		let client = self.ctx.new_client(&self.host, self.pass.clone());
		client.set_nick(nick.as_str());
		client.set_username(username);
		if let Err(e) = self.ctx.registry.register(&client) {
			debug!(conn_id = self.conn_id, error = %e, "registration raced for nick");
			self.nick = None;
			return self.numeric(rb, "433", [nick.as_str(), "Nickname is already in use"]);
		}

		client.attach_session(Arc::clone(&self.session));
		self.client.detach_session(self.conn_id);
		self.client = client;
		self.registered = true;

		info!(conn_id = self.conn_id, nick = %nick, account = self.client.account_name(), "client registered");
		self.welcome(rb)
	}

	fn welcome(&self, rb: &mut ResponseBuffer) -> Result<(), ResponseBufferError> {
		let text = format!(
			"Welcome to the {} Network, {}",
			self.ctx.identity.network(),
			self.client.nick()
		);
		self.numeric(rb, "001", [text])
	}

	async fn handle_message_to_user(
		&mut self,
		command: &str,
		msg: &Message,
		rb: &mut ResponseBuffer,
	) -> Result<(), ResponseBufferError> {
		let is_notice = command == NOTICE;
		let (Some(target), Some(text)) = (msg.params.first(), msg.params.get(1)) else {
			if is_notice {
				return Ok(());
			}
			return self.numeric(rb, "412", ["No text to send"]);
		};

		let Some(recipient) = self.ctx.registry.find_by_nick(target) else {
			if is_notice {
				return Ok(());
			}
			return self.numeric(rb, "401", [target.as_str(), "No such nick"]);
		};

		let source_mask = self.client.nick_mask();
		let account = self.client.account_name().to_string();
		let recipient_nick = recipient.nick();

		// ":<mask> PRIVMSG <target> :" + CRLF
		let overhead = source_mask.len() + command.len() + recipient_nick.len() + 7;
		// maxline sessions get the text unsplit, so it has to fit the long limit with our prefix
		if text.len() + overhead > self.ctx.settings.max_line_len_long {
			debug!(conn_id = self.conn_id, len = text.len(), "relayed line would exceed the long limit");
			if is_notice {
				return Ok(());
			}
			return self.numeric(rb, "417", ["Input line was too long"]);
		}
		let wrap_at = self.ctx.settings.max_line_len.saturating_sub(overhead).max(1);
		let split = SplitMessage::wrap(text, wrap_at, Utc::now(), secret_token);

		let client_tags: Tags = msg
			.tags
			.iter()
			.filter(|(k, _)| k.starts_with('+'))
			.map(|(k, v)| (k.clone(), v.clone()))
			.collect();
		let tags = (!client_tags.is_empty()).then_some(&client_tags);

		for session in recipient.sessions() {
			deliver(&recipient, session, &source_mask, &account, tags, command, &recipient_nick, &split).await;
		}
		for session in self.client.sessions() {
			if session.id() == self.session.id() || recipient.id() == self.client.id() {
				continue;
			}
			deliver(&self.client, session, &source_mask, &account, tags, command, &recipient_nick, &split).await;
		}

		self.ctx.history.push(
			&conversation_key(&self.client.nick(), &recipient_nick),
			HistoryItem {
				source_mask,
				account,
				command: command.to_string(),
				target: recipient_nick,
				message: split,
			},
		);

		Ok(())
	}

	async fn handle_chathistory(&mut self, msg: &Message, rb: &mut ResponseBuffer) -> Result<(), ResponseBufferError> {
		let server = self.server_name();
		let sub = msg.params.first().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
		if sub != "LATEST" {
			return rb.add(
				None,
				&server,
				"FAIL",
				["CHATHISTORY", "INVALID_PARAMS", sub.as_str(), "Only LATEST is supported"],
			);
		}

		let (Some(target), Some(selector), Some(limit)) = (msg.params.get(1), msg.params.get(2), msg.params.get(3))
		else {
			return self.numeric(rb, "461", ["CHATHISTORY", "Not enough parameters"]);
		};
		let limit = match limit.parse::<usize>() {
			Ok(n) if selector == "*" => n.min(self.ctx.history.capacity()),
			_ => {
				return rb.add(
					None,
					&server,
					"FAIL",
					["CHATHISTORY", "INVALID_PARAMS", selector.as_str(), "Invalid selector or limit"],
				);
			}
		};

		let items = self
			.ctx
			.history
			.latest(&conversation_key(&self.client.nick(), target), limit);
		debug!(conn_id = self.conn_id, target = %target, count = items.len(), "replaying history");

		let batch_id = rb.start_nested_history_batch([target.as_str()])?;
		let replayed = replay_history(rb, &items).await;
		// close the batch even when a periodic flush failed, so the outer batch stays balanced
		let closed = match batch_id {
			Some(batch_id) => rb.end_nested_batch(&batch_id),
			None => Ok(()),
		};
		replayed.and(closed)
	}
}

/// Queue `items` into `rb`, flushing every `HISTORY_FLUSH_EVERY` messages.
async fn replay_history(rb: &mut ResponseBuffer, items: &[HistoryItem]) -> Result<(), ResponseBufferError> {
	for (i, item) in items.iter().enumerate() {
		rb.add_split_message_from_client(
			&item.source_mask,
			&item.account,
			None,
			&item.command,
			&item.target,
			&item.message,
		)?;
		if (i + 1) % HISTORY_FLUSH_EVERY == 0 {
			rb.flush(true).await?;
		}
	}
	Ok(())
}

/// Parses a `CAP REQ` list like `a -b c`; `None` if any name is unknown.
fn parse_cap_request(requested: &str) -> Option<Vec<(Capability, bool)>> {
	requested
		.split_whitespace()
		.map(|name| match name.strip_prefix('-') {
			Some(name) => name.parse::<Capability>().ok().map(|c| (c, false)),
			None => name.parse::<Capability>().ok().map(|c| (c, true)),
		})
		.collect()
}

/// Relay to one session of `to`. Delivery to other sessions never blocks.
#[allow(clippy::too_many_arguments)]
async fn deliver(
	to: &Arc<Client>,
	session: Arc<Session>,
	source_mask: &str,
	account: &str,
	tags: Option<&Tags>,
	command: &str,
	target: &str,
	split: &SplitMessage,
) {
	let session_id = session.id();
	let mut out = ResponseBuffer::new(Arc::clone(to), session, "");
	let result = match out.add_split_message_from_client(source_mask, account, tags, command, target, split) {
		Ok(()) => out.send(false).await,
		Err(e) => Err(e),
	};
	if let Err(e) = result {
		debug!(session_id, error = %e, "message not delivered");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn history_items(count: usize) -> Vec<HistoryItem> {
		let time = Utc::now();
		(0..count)
			.map(|i| HistoryItem {
				source_mask: "bob!bob@127.0.0.1".to_string(),
				account: "*".to_string(),
				command: PRIVMSG.to_string(),
				target: "alice".to_string(),
				message: SplitMessage::wrap(&format!("line {i}"), 400, time, secret_token),
			})
			.collect()
	}

	#[tokio::test]
	async fn history_batch_is_closed_when_replay_flush_fails() {
		let identity = Arc::new(crate::server::client::ServerIdentity::new("irc.test", "TestNet"));
		let client = Arc::new(Client::new(1, identity, "127.0.0.1", None));
		let caps: CapabilitySet = [Capability::Batch].into_iter().collect();
		let (session, rx) = Session::detached(1, caps, 4);
		drop(rx);

		let mut rb = ResponseBuffer::new(client, Arc::new(session), "");
		let batch_id = rb.start_nested_history_batch(["bob"]).expect("open").expect("batch");
		let replayed = replay_history(&mut rb, &history_items(HISTORY_FLUSH_EVERY + 1)).await;
		assert!(replayed.is_err(), "queue is closed");
		assert_eq!(rb.nested_depth(), 1);

		rb.end_nested_batch(&batch_id).expect("still closable after a failed flush");
		assert_eq!(rb.nested_depth(), 0);
		// the failed flush drained everything queued before it
		assert_eq!(rb.len(), 1, "only the batch end is queued");
	}

	#[test]
	fn cap_request_parsing() {
		let changes = parse_cap_request("server-time -batch").expect("known caps");
		assert_eq!(changes, vec![(Capability::ServerTime, true), (Capability::Batch, false)]);
		assert!(parse_cap_request("server-time bogus").is_none());
		assert_eq!(parse_cap_request(""), Some(Vec::new()));
	}
}
