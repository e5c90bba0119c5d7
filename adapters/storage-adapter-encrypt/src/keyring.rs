//! Key derivation and recovery-key formatting.
//!
//! The user master key (UMK) is 32 random bytes, never stored in the clear.
//! It is kept wrapped (AES-GCM under a key-encryption key) once per unlock
//! path: passphrase (PBKDF2-SHA256), platform authenticator secret, and the
//! recovery key. Data keys are derived per namespace with HMAC-SHA256.

use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use replicate::prelude::*;

pub const UMK_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const RECOVERY_KEY_LEN: usize = 20;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Crockford base32: no I, L, O, U, so transcription mistakes stay rare.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Derive the key-encryption key from a passphrase.
pub fn kek_from_passphrase(passphrase: &str, salt: &[u8]) -> [u8; UMK_LEN] {
	let mut kek = [0u8; UMK_LEN];
	pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut kek);
	kek
}

/// Derive the key-encryption key from a platform authenticator secret or the
/// raw recovery key. A single HMAC round is enough: the input is already
/// high-entropy.
pub fn kek_from_secret(secret: &[u8], salt: &[u8]) -> ClResult<[u8; UMK_LEN]> {
	let mut mac = Hmac::<Sha256>::new_from_slice(salt)
		.map_err(|_| Error::Crypto("invalid salt length".into()))?;
	mac.update(secret);
	Ok(mac.finalize().into_bytes().into())
}

/// Derive the per-namespace data key from the unwrapped UMK.
pub fn data_key(umk: &[u8], namespace: &str) -> ClResult<[u8; UMK_LEN]> {
	let mut mac = Hmac::<Sha256>::new_from_slice(umk)
		.map_err(|_| Error::Crypto("invalid master key length".into()))?;
	mac.update(namespace.as_bytes());
	Ok(mac.finalize().into_bytes().into())
}

/// Format a raw recovery key for transcription: Crockford base32 in groups of
/// four characters.
pub fn format_recovery_key(raw: &[u8]) -> String {
	let mut bits: u32 = 0;
	let mut bit_count: u32 = 0;
	let mut chars = Vec::new();
	for byte in raw {
		bits = (bits << 8) | u32::from(*byte);
		bit_count += 8;
		while bit_count >= 5 {
			bit_count -= 5;
			chars.push(CROCKFORD[((bits >> bit_count) & 0x1f) as usize]);
		}
	}
	if bit_count > 0 {
		chars.push(CROCKFORD[((bits << (5 - bit_count)) & 0x1f) as usize]);
	}

	let mut out = String::with_capacity(chars.len() + chars.len() / 4);
	for (i, c) in chars.iter().enumerate() {
		if i > 0 && i % 4 == 0 {
			out.push('-');
		}
		out.push(char::from(*c));
	}
	out
}

/// Parse a transcribed recovery key back to raw bytes. Accepts lowercase and
/// the usual Crockford aliases (I/L → 1, O → 0); separators are ignored.
pub fn parse_recovery_key(formatted: &str) -> ClResult<Vec<u8>> {
	let mut bits: u32 = 0;
	let mut bit_count: u32 = 0;
	let mut out = Vec::with_capacity(RECOVERY_KEY_LEN);
	for c in formatted.chars() {
		if c == '-' || c.is_whitespace() {
			continue;
		}
		let c = match c.to_ascii_uppercase() {
			'I' | 'L' => '1',
			'O' => '0',
			other => other,
		};
		let value = CROCKFORD
			.iter()
			.position(|&b| b == c as u8)
			.ok_or_else(|| Error::Crypto(format!("invalid recovery key character '{}'", c)))?;
		bits = (bits << 5) | value as u32;
		bit_count += 5;
		if bit_count >= 8 {
			bit_count -= 8;
			out.push(((bits >> bit_count) & 0xff) as u8);
		}
	}
	if out.len() != RECOVERY_KEY_LEN {
		return Err(Error::Crypto("recovery key has wrong length".into()));
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_recovery_key_roundtrip() {
		let raw: Vec<u8> = (0..RECOVERY_KEY_LEN as u8).collect();
		let formatted = format_recovery_key(&raw);
		assert!(formatted.split('-').all(|group| group.len() == 4));
		let parsed = parse_recovery_key(&formatted).expect("parse");
		assert_eq!(parsed, raw);
	}

	#[test]
	fn test_recovery_key_accepts_aliases() {
		let raw = vec![0xffu8; RECOVERY_KEY_LEN];
		let formatted = format_recovery_key(&raw).to_lowercase();
		let parsed = parse_recovery_key(&formatted).expect("parse");
		assert_eq!(parsed, raw);
	}

	#[test]
	fn test_passphrase_kek_depends_on_salt() {
		let a = kek_from_passphrase("correct horse", &[0u8; SALT_LEN]);
		let b = kek_from_passphrase("correct horse", &[1u8; SALT_LEN]);
		assert_ne!(a, b);
	}

	#[test]
	fn test_data_keys_differ_per_namespace() {
		let umk = [7u8; UMK_LEN];
		let a = data_key(&umk, "tasks:a").expect("key");
		let b = data_key(&umk, "tasks:b").expect("key");
		assert_ne!(a, b);
	}
}

// vim: ts=4
