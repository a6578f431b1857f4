use rand::{Rng as _, distributions::Alphanumeric};

/// Every resume token starts with this.
pub const RESUME_TOKEN_PREFIX: &str = "RT_";

/// Alphanumerics generated after the prefix. At ~5.95 bits per character this
/// is ~154 bits of entropy, comfortably past the 128-bit floor.
const GENERATED_SUFFIX_LEN: usize = 26;

/// Shortest suffix accepted from the wire: 22 alphanumerics ≈ 128 bits.
const MIN_SUFFIX_LEN: usize = 22;

/// Generate a fresh resume token.
pub fn generate() -> String {
	let suffix: String = rand::thread_rng()
		.sample_iter(&Alphanumeric)
		.take(GENERATED_SUFFIX_LEN)
		.map(char::from)
		.collect();
	format!("{RESUME_TOKEN_PREFIX}{suffix}")
}

/// Check the shape of a token without consulting any store.
pub fn is_well_formed(token: &str) -> bool {
	token
		.strip_prefix(RESUME_TOKEN_PREFIX)
		.is_some_and(|suffix| {
			suffix.len() >= MIN_SUFFIX_LEN && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
		})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generated_tokens_are_well_formed_and_distinct() {
		let a = generate();
		let b = generate();
		assert!(is_well_formed(&a));
		assert!(is_well_formed(&b));
		assert_ne!(a, b);
		assert_eq!(a.len(), RESUME_TOKEN_PREFIX.len() + GENERATED_SUFFIX_LEN);
	}

	#[test]
	fn malformed_tokens_are_rejected() {
		assert!(!is_well_formed(""));
		assert!(!is_well_formed("RT_"));
		assert!(!is_well_formed("RT_short"));
		assert!(!is_well_formed("XX_abcdefghijklmnopqrstuv"));
		assert!(!is_well_formed("RT_abcdefghij-lmnopqrstuv"));
	}
}
