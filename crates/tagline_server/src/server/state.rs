#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tagline_domain::casefold;
use thiserror::Error;

use crate::server::client::{Client, ServerIdentity};
use crate::server::history::History;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
	#[error("nickname is already in use: {0}")]
	NickInUse(String),
}

/// Nick and account lookup for connected clients.
#[derive(Debug, Default)]
pub struct Registry {
	inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
	by_nick: HashMap<String, Arc<Client>>,
	by_account: HashMap<String, Arc<Client>>,
}

impl Registry {
	/// Claim the client's current nick (and account, if any).
	pub fn register(&self, client: &Arc<Client>) -> Result<(), RegistryError> {
		let nick = client.nick();
		let key = casefold(&nick);

		let mut inner = self.inner.write();
		if let Some(existing) = inner.by_nick.get(&key)
			&& existing.id() != client.id()
		{
			return Err(RegistryError::NickInUse(nick));
		}

		inner.by_nick.insert(key, Arc::clone(client));
		if let Some(account) = client.account() {
			inner.by_account.insert(casefold(account), Arc::clone(client));
		}
		Ok(())
	}

	pub fn find_by_nick(&self, nick: &str) -> Option<Arc<Client>> {
		self.inner.read().by_nick.get(&casefold(nick)).cloned()
	}

	pub fn find_by_account(&self, account: &str) -> Option<Arc<Client>> {
		self.inner.read().by_account.get(&casefold(account)).cloned()
	}

	pub fn is_nick_available(&self, nick: &str, for_client: u64) -> bool {
		self.inner
			.read()
			.by_nick
			.get(&casefold(nick))
			.is_none_or(|c| c.id() == for_client)
	}

	/// Move `client` from its current nick to `new_nick`.
	pub fn rename(&self, client: &Arc<Client>, new_nick: &str) -> Result<(), RegistryError> {
		let new_key = casefold(new_nick);
		let old_key = casefold(&client.nick());

		let mut inner = self.inner.write();
		if let Some(existing) = inner.by_nick.get(&new_key)
			&& existing.id() != client.id()
		{
			return Err(RegistryError::NickInUse(new_nick.to_string()));
		}

		if inner.by_nick.get(&old_key).is_some_and(|c| c.id() == client.id()) {
			inner.by_nick.remove(&old_key);
		}
		inner.by_nick.insert(new_key, Arc::clone(client));
		client.set_nick(new_nick);
		Ok(())
	}

	/// Drop every entry that points at `client`.
	pub fn remove(&self, client: &Client) {
		let mut inner = self.inner.write();
		inner.by_nick.retain(|_, c| c.id() != client.id());
		inner.by_account.retain(|_, c| c.id() != client.id());
	}

	#[allow(dead_code)]
	pub fn len(&self) -> usize {
		self.inner.read().by_nick.len()
	}
}

/// Everything a connection handler needs that outlives the connection.
#[derive(Debug)]
pub struct ServerContext {
	pub identity: Arc<ServerIdentity>,
	pub registry: Registry,
	pub history: History,
	pub settings: ConnectionSettings,
	/// account name -> sha256(password) hex
	pub accounts: BTreeMap<String, String>,
	next_client_id: AtomicU64,
}

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Line length for clients without the maxline capability.
	pub max_line_len: usize,
	/// Line length used on the wire when maxline is negotiated (and for input).
	pub max_line_len_long: usize,
	pub outbound_queue_capacity: usize,
	pub server_time: bool,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_line_len: tagline_protocol::DEFAULT_MAX_LINE_LEN,
			max_line_len_long: 2048,
			outbound_queue_capacity: 256,
			server_time: true,
		}
	}
}

impl ServerContext {
	pub fn new(
		identity: ServerIdentity,
		history: History,
		settings: ConnectionSettings,
		accounts: BTreeMap<String, String>,
	) -> Self {
		Self {
			identity: Arc::new(identity),
			registry: Registry::default(),
			history,
			settings,
			accounts: accounts.into_iter().map(|(k, v)| (casefold(&k), v)).collect(),
			next_client_id: AtomicU64::new(1),
		}
	}

	pub fn new_client(&self, hostname: &str, account: Option<String>) -> Arc<Client> {
		let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
		Arc::new(Client::new(id, Arc::clone(&self.identity), hostname, account))
	}

	pub fn account_password_hash(&self, account: &str) -> Option<&str> {
		self.accounts.get(&casefold(account)).map(String::as_str)
	}
}
