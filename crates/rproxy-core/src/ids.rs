//! Short identifier generation.
//!
//! `spec.md` §4.2 requires a `userId` of at most 12 printable characters, user-visible as the
//! `Uri` of CONNECT/DISCONNECT/TRANSFER frames. This is adapted from the teacher's
//! [`jetsocat::jmux::id`]-style small ID-management type, swapped from bit-allocated numeric
//! channel ids (which are never exposed outside the process) to random short strings, since a
//! userId here doubles as wire-visible protocol data.

use rand::Rng as _;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a random userId of `len` printable ASCII characters (`len` must be `<= 12` per spec).
pub fn generate_user_id(len: usize) -> String {
    debug_assert!(len <= 12, "userId must be at most 12 printable characters");

    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Generates a random client key of the form `ZC-XXXXXX`, the prefix the server exposes to
/// SOCKS5 users (spec.md §3). Clients are free to choose any key; this is offered as the
/// convenient default for the client binary.
pub fn generate_client_key() -> String {
    format!("ZC-{}", generate_user_id(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_has_requested_length() {
        let id = generate_user_id(12);
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn client_key_has_zc_prefix() {
        let key = generate_client_key();
        assert!(key.starts_with("ZC-"));
    }
}
