#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol feature flags a session can negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
	LabeledResponse,
	MessageTags,
	AccountTag,
	ServerTime,
	Batch,
	EventPlayback,
	MaxLine,
}

impl Capability {
	/// Every capability the server knows about, in `CAP LS` order.
	pub const ALL: [Capability; 7] = [
		Capability::AccountTag,
		Capability::Batch,
		Capability::LabeledResponse,
		Capability::EventPlayback,
		Capability::MessageTags,
		Capability::MaxLine,
		Capability::ServerTime,
	];

	/// Stable wire name.
	pub const fn as_str(self) -> &'static str {
		match self {
			Capability::LabeledResponse => "draft/labeled-response-0.2",
			Capability::MessageTags => "message-tags",
			Capability::AccountTag => "account-tag",
			Capability::ServerTime => "server-time",
			Capability::Batch => "batch",
			Capability::EventPlayback => "draft/event-playback",
			Capability::MaxLine => "oragono.io/maxline-2",
		}
	}

	const fn bit(self) -> u32 {
		1 << (self as u32)
	}
}

impl fmt::Display for Capability {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown capability: {0}")]
	UnknownCapability(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Capability {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		Capability::ALL
			.into_iter()
			.find(|c| c.as_str().eq_ignore_ascii_case(s))
			.ok_or_else(|| ParseIdError::UnknownCapability(s.to_string()))
	}
}

/// Set of negotiated capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
	pub const fn new() -> Self {
		Self(0)
	}

	/// A set holding every known capability.
	pub fn all() -> Self {
		Capability::ALL.into_iter().collect()
	}

	#[inline]
	pub fn has(&self, cap: Capability) -> bool {
		self.0 & cap.bit() != 0
	}

	pub fn enable(&mut self, cap: Capability) {
		self.0 |= cap.bit();
	}

	pub fn disable(&mut self, cap: Capability) {
		self.0 &= !cap.bit();
	}

	pub fn enable_many(&mut self, caps: impl IntoIterator<Item = Capability>) {
		for cap in caps {
			self.enable(cap);
		}
	}

	pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
		Capability::ALL.into_iter().filter(|c| self.has(*c))
	}

	pub fn len(&self) -> usize {
		self.0.count_ones() as usize
	}

	pub fn is_empty(&self) -> bool {
		self.0 == 0
	}
}

impl FromIterator<Capability> for CapabilitySet {
	fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
		let mut set = CapabilitySet::new();
		set.enable_many(iter);
		set
	}
}

impl fmt::Display for CapabilitySet {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut first = true;
		for cap in self.iter() {
			if !first {
				f.write_str(" ")?;
			}
			f.write_str(cap.as_str())?;
			first = false;
		}
		Ok(())
	}
}

/// Client nickname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nickname(String);

impl Nickname {
	/// Create a validated nickname.
	pub fn new(nick: impl Into<String>) -> Result<Self, ParseIdError> {
		let nick = nick.into();
		if nick.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let first = nick.chars().next().unwrap_or(' ');
		if first == ':' || first == '#' || first.is_ascii_digit() {
			return Err(ParseIdError::InvalidFormat(format!("nickname cannot start with {first:?}")));
		}
		if nick.chars().any(|c| c.is_whitespace() || c == ',' || c == '*' || c == '!' || c == '@') {
			return Err(ParseIdError::InvalidFormat(format!("nickname contains a forbidden character: {nick}")));
		}

		Ok(Self(nick))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Case-insensitive key used for lookups.
	pub fn casefold(&self) -> String {
		casefold(&self.0)
	}
}

impl fmt::Display for Nickname {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Nickname {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Nickname::new(s.to_string())
	}
}

/// ASCII casefolding (rfc1459 brackets included).
pub fn casefold(s: &str) -> String {
	s.chars()
		.map(|c| match c {
			'[' => '{',
			']' => '}',
			'\\' => '|',
			'~' => '^',
			other => other.to_ascii_lowercase(),
		})
		.collect()
}
