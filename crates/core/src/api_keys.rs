//! API key hashing and header parsing.
//!
//! Keys are issued by the surrounding account system; the dispatcher only
//! ever sees the plaintext on the wire and looks callers up by hash.

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Number of leading characters stored as a human-visible prefix.
pub const KEY_PREFIX_LENGTH: usize = 8;

/// Shortest key the dispatcher will bother hashing.
pub const MIN_KEY_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Compute the SHA-256 hex digest of an API key.
///
/// Caller lookups are always by hash; plaintext keys are never stored.
pub fn hash_api_key(key: &str) -> String {
    crate::hashing::sha256_hex(key.as_bytes())
}

/// Extract the prefix from a plaintext API key, used in log lines.
pub fn extract_prefix(key: &str) -> &str {
    let end = key
        .char_indices()
        .nth(KEY_PREFIX_LENGTH)
        .map(|(i, _)| i)
        .unwrap_or(key.len());
    &key[..end]
}

// ---------------------------------------------------------------------------
// Header parsing
// ---------------------------------------------------------------------------

/// Pull the key out of an `Authorization: Bearer <key>` header value.
///
/// Returns `None` for other schemes, empty tokens, and keys shorter than
/// [`MIN_KEY_LENGTH`].
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let token = header_value.strip_prefix("Bearer ")?.trim();
    plausible_key(token)
}

/// Accept a raw key (e.g. from `X-API-Key`) if it looks like one.
pub fn plausible_key(key: &str) -> Option<&str> {
    let key = key.trim();
    if key.len() < MIN_KEY_LENGTH || key.chars().any(char::is_whitespace) {
        return None;
    }
    Some(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
