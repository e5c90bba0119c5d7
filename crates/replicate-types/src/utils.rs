//! Utility functions

use crate::prelude::*;
use rand::RngExt;

pub const ID_LENGTH: usize = 24;
pub const SAFE: [char; 62] = [
	'0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
	'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
	'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
	'V', 'W', 'X', 'Y', 'Z',
];

pub fn random_id() -> ClResult<String> {
	let mut rng = rand::rng();
	let mut result = String::with_capacity(ID_LENGTH);

	for _ in 0..ID_LENGTH {
		result.push(SAFE[rng.random_range(0..SAFE.len())]);
	}
	Ok(result)
}

/// Fold a 128-bit uuid string into the 53-bit actor id space used by the CRDT
/// substrate (kept under 2^53 so the id survives a JSON number round-trip with
/// peers that store actor ids as doubles).
pub fn fold_client_id(id: &str) -> u64 {
	let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
	for b in id.as_bytes() {
		acc ^= u64::from(*b);
		acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
	}
	acc & ((1 << 53) - 1)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_random_id_shape() {
		let id = random_id().expect("id");
		assert_eq!(id.len(), ID_LENGTH);
		assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
	}

	#[test]
	fn test_fold_client_id_stable_and_bounded() {
		let a = fold_client_id("7c9e6679-7425-40de-944b-e07fc1f90ae7");
		let b = fold_client_id("7c9e6679-7425-40de-944b-e07fc1f90ae7");
		assert_eq!(a, b);
		assert!(a < (1 << 53));
		assert_ne!(a, fold_client_id("00000000-0000-0000-0000-000000000000"));
	}
}

// vim: ts=4
