use base64::prelude::{BASE64_STANDARD, Engine as _};

use crate::error::AuthError;

pub const MAX_CLIENT_ID_LEN: usize = 100;
pub const MAX_CLIENT_SECRET_LEN: usize = 200;

fn validate_pair(client_id: &str, client_secret: &str) -> Result<(), AuthError> {
	if client_id.is_empty() || client_secret.is_empty() {
		return Err(AuthError::InvalidFormat);
	}
	if client_id.len() > MAX_CLIENT_ID_LEN || client_secret.len() > MAX_CLIENT_SECRET_LEN {
		return Err(AuthError::InvalidFormat);
	}
	if client_id.contains(':') || client_secret.contains(':') {
		return Err(AuthError::InvalidFormat);
	}
	Ok(())
}

/// Build the HELLO token: `base64(utf8(clientId + ":" + clientSecret))`.
pub fn encode_credentials(client_id: &str, client_secret: &str) -> Result<String, AuthError> {
	validate_pair(client_id, client_secret)?;
	Ok(BASE64_STANDARD.encode(format!("{client_id}:{client_secret}")))
}

/// Decode and split a HELLO token.
///
/// The decoded text must contain exactly one `:`; more or fewer is a format
/// error, never a credentials mismatch.
pub fn decode_credentials(token: &str) -> Result<(String, String), AuthError> {
	if token.is_empty() {
		return Err(AuthError::MissingToken);
	}

	let raw = BASE64_STANDARD
		.decode(token)
		.map_err(|_| AuthError::InvalidFormat)?;
	let text = String::from_utf8(raw).map_err(|_| AuthError::InvalidFormat)?;

	if text.bytes().filter(|b| *b == b':').count() != 1 {
		return Err(AuthError::InvalidFormat);
	}

	// UNWRAP: exactly one colon, checked above
	let (client_id, client_secret) = text.split_once(':').unwrap();
	validate_pair(client_id, client_secret)?;
	Ok((client_id.to_string(), client_secret.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip() {
		let token = encode_credentials("default-client", "default-secret-2024").unwrap();
		let (id, secret) = decode_credentials(&token).unwrap();
		assert_eq!(id, "default-client");
		assert_eq!(secret, "default-secret-2024");
	}

	#[test]
	fn colon_count_must_be_exactly_one() {
		let no_colon = BASE64_STANDARD.encode("just-an-id");
		assert_eq!(decode_credentials(&no_colon), Err(AuthError::InvalidFormat));

		let two_colons = BASE64_STANDARD.encode("id:se:cret");
		assert_eq!(decode_credentials(&two_colons), Err(AuthError::InvalidFormat));
	}

	#[test]
	fn empty_and_oversized_parts_are_format_errors() {
		assert_eq!(decode_credentials(""), Err(AuthError::MissingToken));

		let empty_secret = BASE64_STANDARD.encode("id:");
		assert_eq!(decode_credentials(&empty_secret), Err(AuthError::InvalidFormat));

		let empty_id = BASE64_STANDARD.encode(":secret");
		assert_eq!(decode_credentials(&empty_id), Err(AuthError::InvalidFormat));

		let long_id = format!("{}:secret", "x".repeat(MAX_CLIENT_ID_LEN + 1));
		let token = BASE64_STANDARD.encode(long_id);
		assert_eq!(decode_credentials(&token), Err(AuthError::InvalidFormat));

		assert!(encode_credentials("id", &"s".repeat(MAX_CLIENT_SECRET_LEN + 1)).is_err());
		assert!(encode_credentials("with:colon", "secret").is_err());
	}

	#[test]
	fn invalid_base64_is_a_format_error() {
		assert_eq!(
			decode_credentials("not~~base64!!"),
			Err(AuthError::InvalidFormat)
		);
	}
}
