#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::RwLock;

use crate::server::session::Session;

/// Nick used before registration completes.
pub const UNREGISTERED_NICK: &str = "*";

/// Source used for server-originated messages.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
	name: String,
	network: String,
}

impl ServerIdentity {
	pub fn new(name: impl Into<String>, network: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			network: network.into(),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn network(&self) -> &str {
		&self.network
	}
}

/// A logical user; several sessions may be attached when they share an account.
#[derive(Debug)]
pub struct Client {
	id: u64,
	nick: RwLock<String>,
	username: RwLock<String>,
	hostname: String,
	account: Option<String>,
	server: Arc<ServerIdentity>,
	sessions: RwLock<Vec<Arc<Session>>>,
}

impl Client {
	pub fn new(id: u64, server: Arc<ServerIdentity>, hostname: impl Into<String>, account: Option<String>) -> Self {
		Self {
			id,
			nick: RwLock::new(UNREGISTERED_NICK.to_string()),
			username: RwLock::new("user".to_string()),
			hostname: hostname.into(),
			account,
			server,
			sessions: RwLock::new(Vec::new()),
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn nick(&self) -> String {
		self.nick.read().clone()
	}

	pub fn set_nick(&self, nick: impl Into<String>) {
		*self.nick.write() = nick.into();
	}

	pub fn set_username(&self, username: impl Into<String>) {
		*self.username.write() = username.into();
	}

	/// `nick!user@host`.
	pub fn nick_mask(&self) -> String {
		format!("{}!{}@{}", self.nick.read(), self.username.read(), self.hostname)
	}

	pub fn account(&self) -> Option<&str> {
		self.account.as_deref()
	}

	/// Account name for the `account` tag; `*` when logged out.
	pub fn account_name(&self) -> &str {
		self.account.as_deref().unwrap_or("*")
	}

	pub fn server(&self) -> &ServerIdentity {
		&self.server
	}

	/// Snapshot of attached sessions.
	pub fn sessions(&self) -> Vec<Arc<Session>> {
		self.sessions.read().clone()
	}

	pub fn attach_session(&self, session: Arc<Session>) {
		let mut sessions = self.sessions.write();
		if !sessions.iter().any(|s| s.id() == session.id()) {
			sessions.push(session);
		}
	}

	/// Returns the number of sessions still attached.
	pub fn detach_session(&self, session_id: u64) -> usize {
		let mut sessions = self.sessions.write();
		sessions.retain(|s| s.id() != session_id);
		sessions.len()
	}
}

#[cfg(test)]
mod tests {
	use tagline_domain::CapabilitySet;

	use super::*;

	fn client() -> Client {
		Client::new(
			1,
			Arc::new(ServerIdentity::new("irc.example.net", "ExampleNet")),
			"127.0.0.1",
			Some("alice".to_string()),
		)
	}

	#[test]
	fn nick_mask_and_account() {
		let c = client();
		assert_eq!(c.nick(), UNREGISTERED_NICK);
		c.set_nick("alice");
		c.set_username("al");
		assert_eq!(c.nick_mask(), "alice!al@127.0.0.1");
		assert_eq!(c.account_name(), "alice");
		assert_eq!(c.server().name(), "irc.example.net");
	}

	#[test]
	fn attach_and_detach_sessions() {
		let c = client();
		let (a, _rx_a) = Session::detached(10, CapabilitySet::new(), 4);
		let (b, _rx_b) = Session::detached(11, CapabilitySet::new(), 4);
		let a = Arc::new(a);

		c.attach_session(Arc::clone(&a));
		c.attach_session(a);
		c.attach_session(Arc::new(b));
		assert_eq!(c.sessions().len(), 2);

		assert_eq!(c.detach_session(10), 1);
		assert_eq!(c.detach_session(10), 1);
		assert_eq!(c.detach_session(11), 0);
	}
}
