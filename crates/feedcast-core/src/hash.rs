use crate::link::canonical_url;

/// Number of hex characters in a content hash.
pub const CONTENT_HASH_LEN: usize = 16;

/// Computes BLAKE3 and returns the 32-byte digest.
pub fn blake3_32(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Content digest of `title|canonical_url(link)`, truncated to 16 hex chars.
///
/// Catches the same article re-published under a different tracking query
/// when link canonicalization alone is not enough.
pub fn content_hash(title: &str, link: &str) -> String {
    let preimage = format!("{title}|{}", canonical_url(link));
    let digest = blake3_32(preimage.as_bytes());
    hex::encode(&digest[..CONTENT_HASH_LEN / 2])
}
