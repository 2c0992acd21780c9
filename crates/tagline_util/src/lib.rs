#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::{IpAddr, SocketAddr};

	/// Well-known plaintext IRC port.
	pub const DEFAULT_PORT: u16 = 6667;

	/// Default plaintext listener.
	pub const DEFAULT_BIND: &str = "irc://127.0.0.1";

	#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
	pub enum EndpointError {
		#[error("endpoint must be non-empty (expected [irc://]host[:port])")]
		Empty,
		#[error("TLS listeners are not supported, use irc:// behind a terminating proxy: {0}")]
		Tls(String),
		#[error("unsupported endpoint scheme {scheme:?} (expected irc://): {endpoint}")]
		Scheme { scheme: String, endpoint: String },
		#[error("invalid endpoint host: {0}")]
		Host(String),
		#[error("invalid endpoint port (expected 1..=65535): {0}")]
		Port(String),
		#[error("listen host must be an IP literal, not {0}")]
		NotIpLiteral(String),
	}

	/// A plaintext IRC listen address: `irc://host[:port]` or bare `host[:port]`.
	///
	/// IPv6 hosts are written bracketed (`irc://[::1]:6667`) and stored without brackets.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct IrcEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl IrcEndpoint {
		pub fn parse(s: &str) -> Result<Self, EndpointError> {
			let s = s.trim();
			if s.is_empty() {
				return Err(EndpointError::Empty);
			}

			let rest = match s.split_once("://") {
				None => s,
				Some(("irc", rest)) => rest,
				Some(("ircs", _)) => return Err(EndpointError::Tls(s.to_string())),
				Some((scheme, _)) => {
					return Err(EndpointError::Scheme {
						scheme: scheme.to_string(),
						endpoint: s.to_string(),
					});
				}
			};
			let rest = rest.strip_suffix('/').unwrap_or(rest);

			let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
				let (host, after) = bracketed
					.split_once(']')
					.ok_or_else(|| EndpointError::Host(s.to_string()))?;
				match after {
					"" => (host, None),
					_ => match after.strip_prefix(':') {
						Some(port) => (host, Some(port)),
						None => return Err(EndpointError::Host(s.to_string())),
					},
				}
			} else {
				match rest.split_once(':') {
					Some((_, port)) if port.contains(':') => return Err(EndpointError::Host(s.to_string())),
					Some((host, port)) => (host, Some(port)),
					None => (rest, None),
				}
			};

			if host.is_empty() || host.contains(['/', '?', '#', ' ']) {
				return Err(EndpointError::Host(s.to_string()));
			}

			let port = match port {
				None => DEFAULT_PORT,
				Some(p) => match p.parse::<u16>() {
					Ok(p) if p != 0 => p,
					_ => return Err(EndpointError::Port(s.to_string())),
				},
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}

		/// Resolve without DNS; listeners bind to an address, never a name.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, EndpointError> {
			let ip: IpAddr = self
				.host
				.parse()
				.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))?;
			Ok(SocketAddr::new(ip, self.port))
		}
	}

	impl std::fmt::Display for IrcEndpoint {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			if self.host.contains(':') {
				write!(f, "irc://[{}]:{}", self.host, self.port)
			} else {
				write!(f, "irc://{}:{}", self.host, self.port)
			}
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn port_defaults_to_6667() {
			let e = IrcEndpoint::parse(DEFAULT_BIND).unwrap();
			assert_eq!(e.port, DEFAULT_PORT);
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "127.0.0.1:6667");
		}

		#[test]
		fn scheme_is_optional() {
			let e = IrcEndpoint::parse("0.0.0.0:6697").unwrap();
			assert_eq!(e.host, "0.0.0.0");
			assert_eq!(e.port, 6697);
			assert_eq!(e.to_string(), "irc://0.0.0.0:6697");
		}

		#[test]
		fn bracketed_ipv6() {
			let e = IrcEndpoint::parse("irc://[::1]:7000").unwrap();
			assert_eq!(e.host, "::1");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:7000");
			assert_eq!(e.to_string(), "irc://[::1]:7000");

			let e = IrcEndpoint::parse("[::]").unwrap();
			assert_eq!(e.port, DEFAULT_PORT);
			assert!(matches!(IrcEndpoint::parse("irc://::1:6667"), Err(EndpointError::Host(_))));
		}

		#[test]
		fn rejects_tls_and_foreign_schemes() {
			assert!(matches!(IrcEndpoint::parse("ircs://127.0.0.1"), Err(EndpointError::Tls(_))));
			assert!(matches!(
				IrcEndpoint::parse("quic://127.0.0.1:6667"),
				Err(EndpointError::Scheme { .. })
			));
		}

		#[test]
		fn rejects_bad_ports_and_paths() {
			assert!(matches!(IrcEndpoint::parse("irc://127.0.0.1:0"), Err(EndpointError::Port(_))));
			assert!(matches!(IrcEndpoint::parse("irc://127.0.0.1:x"), Err(EndpointError::Port(_))));
			assert!(matches!(IrcEndpoint::parse("irc://127.0.0.1/chan"), Err(EndpointError::Host(_))));
			assert!(matches!(IrcEndpoint::parse("  "), Err(EndpointError::Empty)));
		}

		#[test]
		fn dns_names_parse_but_do_not_bind() {
			let e = IrcEndpoint::parse("irc://irc.example.com").unwrap();
			assert!(matches!(
				e.to_socket_addr_if_ip_literal(),
				Err(EndpointError::NotIpLiteral(_))
			));
		}
	}
}

pub mod token {
	/// Unpredictable identifier for batches and message ids.
	///
	/// 122 random bits from the OS CSPRNG, rendered as 32 lowercase hex chars.
	/// Batch ids are bearer handles, not sequence numbers.
	pub fn secret_token() -> String {
		uuid::Uuid::new_v4().simple().to_string()
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn tokens_are_hex_and_distinct() {
			let a = secret_token();
			let b = secret_token();
			assert_eq!(a.len(), 32);
			assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
			assert_ne!(a, b);
		}
	}
}
