#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tagline_protocol::{MAX_TAG_SECTION_LEN, Message};
use tagline_protocol::tags::{BATCH_TAG, LABEL_TAG};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::server::client::ServerIdentity;
use crate::server::connection::serve;
use crate::server::health::HealthState;
use crate::server::history::{History, HistoryConfig};
use crate::server::state::{ConnectionSettings, ServerContext};

const SERVER: &str = "irc.test";

// sha256("hunter2")
const HUNTER2: &str = "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7";

async fn start_server(accounts: BTreeMap<String, String>) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");

	let ctx = Arc::new(ServerContext::new(
		ServerIdentity::new(SERVER, "TestNet"),
		History::new(HistoryConfig::default()),
		ConnectionSettings::default(),
		accounts,
	));
	tokio::spawn(async move {
		let _ = serve(listener, ctx, HealthState::new()).await;
	});
	addr
}

struct TestClient {
	reader: BufReader<OwnedReadHalf>,
	writer: OwnedWriteHalf,
}

impl TestClient {
	async fn connect(addr: SocketAddr) -> Self {
		let stream = TcpStream::connect(addr).await.expect("connect");
		let (r, w) = stream.into_split();
		Self {
			reader: BufReader::new(r),
			writer: w,
		}
	}

	async fn send(&mut self, line: &str) {
		self.writer
			.write_all(format!("{line}\r\n").as_bytes())
			.await
			.expect("write");
	}

	async fn recv(&mut self) -> Message {
		let mut line = String::new();
		let n = timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
			.await
			.expect("expected a line within timeout")
			.expect("read");
		assert!(n > 0, "connection closed");
		Message::parse(line.trim_end()).expect("server sent a parseable line")
	}

	async fn recv_command(&mut self, command: &str) -> Message {
		loop {
			let msg = self.recv().await;
			if msg.command == command {
				return msg;
			}
		}
	}

	async fn assert_silent(&mut self) {
		let mut line = String::new();
		let got = timeout(Duration::from_millis(100), self.reader.read_line(&mut line)).await;
		assert!(got.is_err(), "unexpected line: {line:?}");
	}
}

async fn register(addr: SocketAddr, nick: &str, caps: &str, pass: Option<&str>) -> TestClient {
	let mut c = TestClient::connect(addr).await;
	if !caps.is_empty() {
		c.send("CAP LS 302").await;
		c.recv_command("CAP").await;
		c.send(&format!("CAP REQ :{caps}")).await;
		let ack = c.recv_command("CAP").await;
		assert_eq!(ack.params[1], "ACK", "caps not acknowledged: {ack:?}");
	}
	if let Some(pass) = pass {
		c.send(&format!("PASS {pass}")).await;
	}
	c.send(&format!("NICK {nick}")).await;
	c.send(&format!("USER {nick} 0 * :Test User")).await;
	if !caps.is_empty() {
		c.send("CAP END").await;
	}
	let welcome = c.recv_command("001").await;
	assert_eq!(welcome.source, SERVER);
	c
}

#[tokio::test]
async fn labeled_ping_and_empty_reply_ack() {
	let addr = start_server(BTreeMap::new()).await;
	let mut c = TestClient::connect(addr).await;

	c.send("CAP REQ :draft/labeled-response-0.2").await;
	let ack = c.recv().await;
	assert_eq!(ack.command, "CAP");
	assert_eq!(ack.params, vec!["*", "ACK", "draft/labeled-response-0.2"]);

	c.send("@label=p1 PING tok").await;
	let pong = c.recv().await;
	assert_eq!(pong.command, "PONG");
	assert_eq!(pong.params, vec![SERVER, "tok"]);
	assert_eq!(pong.get_tag(LABEL_TAG), Some("p1"));

	// NICK during negotiation has nothing to say
	c.send("@label=p2 NICK alice").await;
	let ack = c.recv().await;
	assert_eq!(ack.command, "ACK");
	assert_eq!(ack.get_tag(LABEL_TAG), Some("p2"));

	c.send("USER alice 0 * :Alice").await;
	c.send("CAP END").await;
	let welcome = c.recv().await;
	assert_eq!(welcome.command, "001");
	assert_eq!(welcome.params[0], "alice");
}

#[tokio::test]
async fn unlabeled_client_gets_no_ack() {
	let addr = start_server(BTreeMap::new()).await;
	let mut c = TestClient::connect(addr).await;

	c.send("@label=p1 NICK alice").await;
	c.assert_silent().await;
}

#[tokio::test]
async fn commands_require_registration() {
	let addr = start_server(BTreeMap::new()).await;
	let mut c = TestClient::connect(addr).await;

	c.send("PRIVMSG bob :hi").await;
	let err = c.recv().await;
	assert_eq!(err.command, "451");

	let mut c = register(addr, "alice", "", None).await;
	c.send("FROBNICATE").await;
	let err = c.recv().await;
	assert_eq!(err.command, "421");
	assert_eq!(err.params[1], "FROBNICATE");
}

#[tokio::test]
async fn labeled_history_reply_is_batched() {
	let addr = start_server(BTreeMap::new()).await;
	let mut c = register(addr, "alice", "draft/labeled-response-0.2 batch", None).await;

	c.send("@label=h1 CHATHISTORY LATEST bob * 10").await;

	let start = c.recv().await;
	assert_eq!(start.command, "BATCH");
	assert_eq!(start.get_tag(LABEL_TAG), Some("h1"));
	assert_eq!(start.params[1], "draft/labeled-response");
	let top = start.params[0].trim_start_matches('+').to_string();

	let nested_start = c.recv().await;
	assert_eq!(nested_start.params[1], "chathistory");
	assert_eq!(nested_start.params[2], "bob");
	assert_eq!(nested_start.get_tag(BATCH_TAG), Some(top.as_str()));
	let nested = nested_start.params[0].trim_start_matches('+').to_string();
	assert_ne!(nested, top);

	let nested_end = c.recv().await;
	assert_eq!(nested_end.params, vec![format!("-{nested}")]);
	assert_eq!(nested_end.get_tag(BATCH_TAG), Some(top.as_str()));

	let end = c.recv().await;
	assert_eq!(end.params, vec![format!("-{top}")]);
	assert!(!end.has_tag(LABEL_TAG));
}

#[tokio::test]
async fn privmsg_is_delivered_and_replayed() {
	let addr = start_server(BTreeMap::new()).await;
	let mut alice = register(addr, "alice", "", None).await;
	let mut bob = register(addr, "bob", "batch", None).await;

	alice.send("PRIVMSG bob :hello there").await;
	let got = bob.recv().await;
	assert_eq!(got.command, "PRIVMSG");
	assert_eq!(got.source, "alice!alice@127.0.0.1");
	assert_eq!(got.params, vec!["bob", "hello there"]);

	// PONG comes after the message is recorded
	alice.send("PING sync").await;
	alice.recv_command("PONG").await;
	alice.assert_silent().await;

	bob.send("CHATHISTORY LATEST alice * 10").await;
	let start = bob.recv().await;
	assert_eq!(start.command, "BATCH");
	assert_eq!(start.params[1], "chathistory");
	let id = start.params[0].trim_start_matches('+').to_string();

	let replayed = bob.recv().await;
	assert_eq!(replayed.command, "PRIVMSG");
	assert_eq!(replayed.params, vec!["bob", "hello there"]);
	assert_eq!(replayed.get_tag(BATCH_TAG), Some(id.as_str()));

	let end = bob.recv().await;
	assert_eq!(end.params, vec![format!("-{id}")]);
}

#[tokio::test]
async fn privmsg_to_unknown_nick_fails() {
	let addr = start_server(BTreeMap::new()).await;
	let mut alice = register(addr, "alice", "", None).await;

	alice.send("PRIVMSG nobody :hi").await;
	let err = alice.recv().await;
	assert_eq!(err.command, "401");

	alice.send("NOTICE nobody :hi").await;
	alice.assert_silent().await;
}

#[tokio::test]
async fn nick_in_use_is_rejected() {
	let addr = start_server(BTreeMap::new()).await;
	let _alice = register(addr, "alice", "", None).await;

	let mut c = TestClient::connect(addr).await;
	c.send("NICK ALICE").await;
	let err = c.recv().await;
	assert_eq!(err.command, "433");
}

#[tokio::test]
async fn sessions_sharing_an_account_see_nick_changes() {
	let mut accounts = BTreeMap::new();
	accounts.insert("alice".to_string(), HUNTER2.to_string());
	let addr = start_server(accounts).await;

	let mut first = register(addr, "alice", "", Some("alice:hunter2")).await;
	let mut second = register(addr, "alice_", "", Some("alice:hunter2")).await;
	let notice = second.recv_command("NOTICE").await;
	assert!(notice.params[1].contains("2 sessions"), "{notice:?}");

	second.send("NICK alicia").await;
	let own = second.recv_command("NICK").await;
	assert_eq!(own.params, vec!["alicia"]);

	let copy = first.recv_command("NICK").await;
	assert_eq!(copy.source, "alice!alice@127.0.0.1");
	assert_eq!(copy.params, vec!["alicia"]);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
	let mut accounts = BTreeMap::new();
	accounts.insert("alice".to_string(), HUNTER2.to_string());
	let addr = start_server(accounts).await;

	let mut c = TestClient::connect(addr).await;
	c.send("PASS alice:nope").await;
	let err = c.recv().await;
	assert_eq!(err.command, "464");
}

#[tokio::test]
async fn quit_closes_with_error() {
	let addr = start_server(BTreeMap::new()).await;
	let mut c = register(addr, "alice", "", None).await;

	c.send("QUIT :bye").await;
	let err = c.recv().await;
	assert_eq!(err.command, "ERROR");

	let mut line = String::new();
	let n = timeout(Duration::from_secs(2), c.reader.read_line(&mut line))
		.await
		.expect("closed within timeout")
		.expect("read");
	assert_eq!(n, 0);
}

#[tokio::test]
async fn overlong_line_tail_is_not_run_as_a_command() {
	let addr = start_server(BTreeMap::new()).await;
	let mut c = register(addr, "alice", "", None).await;

	let limit = ConnectionSettings::default().max_line_len_long + MAX_TAG_SECTION_LEN;
	c.writer
		.write_all("a".repeat(limit + 1).as_bytes())
		.await
		.expect("write");
	let err = c.recv().await;
	assert_eq!(err.command, "417");
	assert_eq!(err.params[0], "alice");

	// still the same line until its terminator
	c.writer.write_all(b" PING injected\r\n").await.expect("write");
	c.send("PING real").await;
	let pong = c.recv().await;
	assert_eq!(pong.command, "PONG");
	assert_eq!(pong.params, vec![SERVER, "real"]);
	c.assert_silent().await;
}

#[tokio::test]
async fn relayed_text_must_fit_the_long_limit() {
	let addr = start_server(BTreeMap::new()).await;
	let mut alice = register(addr, "alice", "", None).await;
	let mut bob = register(addr, "bob", "oragono.io/maxline-2", None).await;
	let long = ConnectionSettings::default().max_line_len_long;

	alice.send(&format!("PRIVMSG bob :{}", "x".repeat(long))).await;
	let err = alice.recv().await;
	assert_eq!(err.command, "417");
	bob.assert_silent().await;

	// fits with the prefix: a maxline client gets it in one piece
	let text = "y".repeat(long - 100);
	alice.send(&format!("PRIVMSG bob :{text}")).await;
	let got = bob.recv().await;
	assert_eq!(got.command, "PRIVMSG");
	assert_eq!(got.params, vec!["bob".to_string(), text]);
}
