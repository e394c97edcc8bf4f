use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Computes the hex HMAC-SHA1 of `matrix_username` under `secret_key`
/// (spec.md §6: the OAuth `state` parameter is `<matrix_username>|<hex>`).
pub fn hmac_hex(secret_key: &str, matrix_username: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(matrix_username.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Builds the full `state` value embedded in the auth link sent to users.
pub fn build_state(secret_key: &str, matrix_username: &str) -> String {
    format!("{matrix_username}|{}", hmac_hex(secret_key, matrix_username))
}

/// Splits a `state` value and verifies its HMAC in constant time. Returns
/// the matrix username on success.
pub fn verify_state(secret_key: &str, state: &str) -> Option<String> {
    let (matrix_username, provided_hex) = state.split_once('|')?;
    let expected_hex = hmac_hex(secret_key, matrix_username);
    let expected = expected_hex.as_bytes();
    let provided = provided_hex.as_bytes();
    if ring::constant_time::verify_slices_are_equal(expected, provided).is_ok() {
        Some(matrix_username.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_build_and_verify() {
        let state = build_state("s3cret", "@alice:example");
        assert_eq!(verify_state("s3cret", &state).as_deref(), Some("@alice:example"));
    }

    #[test]
    fn rejects_tampered_hmac() {
        let mut state = build_state("s3cret", "@alice:example");
        state.push('0');
        assert_eq!(verify_state("s3cret", &state), None);
    }

    #[test]
    fn rejects_wrong_secret() {
        let state = build_state("s3cret", "@alice:example");
        assert_eq!(verify_state("different", &state), None);
    }

    #[test]
    fn rejects_malformed_state() {
        assert_eq!(verify_state("s3cret", "no-pipe-here"), None);
    }
}
