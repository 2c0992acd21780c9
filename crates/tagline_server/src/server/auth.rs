#![forbid(unsafe_code)]

use anyhow::anyhow;
use sha2::{Digest, Sha256};

/// Credentials from `PASS account:password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassCredentials {
	pub account: String,
	pub password: String,
}

pub fn parse_pass(param: &str) -> anyhow::Result<PassCredentials> {
	let (account, password) = param
		.split_once(':')
		.ok_or_else(|| anyhow!("invalid PASS format (expected account:password)"))?;

	let account = account.trim();
	if account.is_empty() || password.is_empty() {
		return Err(anyhow!("invalid PASS format (expected account:password)"));
	}

	Ok(PassCredentials {
		account: account.to_string(),
		password: password.to_string(),
	})
}

/// Check `password` against a configured sha256 hex digest (either case).
pub fn verify_password(password: &str, expected_sha256_hex: &str) -> bool {
	let Ok(expected) = hex::decode(expected_sha256_hex.trim()) else {
		return false;
	};
	let digest = Sha256::digest(password.as_bytes());

	constant_time_eq(digest.as_slice(), &expected)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	// sha256("hunter2")
	const HUNTER2: &str = "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7";

	#[test]
	fn verifies_matching_password() {
		assert!(verify_password("hunter2", HUNTER2));
		assert!(verify_password("hunter2", &HUNTER2.to_ascii_uppercase()));
		assert!(!verify_password("hunter3", HUNTER2));
		assert!(!verify_password("hunter2", "abc"));
	}

	#[test]
	fn rejects_malformed_or_short_digests() {
		assert!(!verify_password("hunter2", "not hex at all"));
		assert!(!verify_password("hunter2", &HUNTER2[..62]));
		assert!(!verify_password("hunter2", ""));
		assert!(verify_password("hunter2", &format!("  {HUNTER2}\n")));
	}

	#[test]
	fn parses_pass_param() {
		let creds = parse_pass("alice:se:cret").unwrap();
		assert_eq!(creds.account, "alice");
		assert_eq!(creds.password, "se:cret");

		assert!(parse_pass("alice").is_err());
		assert!(parse_pass(":pw").is_err());
		assert!(parse_pass("alice:").is_err());
	}
}
