//! Key generation and hex / bech32 (`nsec`, `npub`) encoding.

use bech32::{Bech32, Hrp};
use rand::RngCore;

use crate::signing::NostrSigner;

/// Decodes a secret key given as 64 hex chars or an `nsec1...` string.
pub fn decode_secret_input(value: &str) -> Option<[u8; 32]> {
    let trimmed = value.trim();
    if let Ok(bytes) = hex::decode(trimmed) {
        if let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return Some(key);
        }
    }
    let (decoded_hrp, data) = bech32::decode(trimmed).ok()?;
    if decoded_hrp.as_str() != "nsec" {
        return None;
    }
    <[u8; 32]>::try_from(data.as_slice()).ok()
}

fn encode_with_hrp(hrp: &str, bytes: &[u8; 32]) -> Option<String> {
    let hrp = Hrp::parse(hrp).ok()?;
    bech32::encode::<Bech32>(hrp, bytes).ok()
}

/// Bech32 `nsec` encoding of a secret key.
pub fn encode_nsec(secret: &[u8; 32]) -> Option<String> {
    encode_with_hrp("nsec", secret)
}

/// Bech32 `npub` encoding of an x-only public key.
pub fn encode_npub(public_key: &[u8; 32]) -> Option<String> {
    encode_with_hrp("npub", public_key)
}

/// Draws random secrets until one is a valid signing key.
pub fn generate_secret() -> [u8; 32] {
    loop {
        let mut candidate = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut candidate);
        if NostrSigner::from_secret(candidate).is_ok() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nsec_round_trips_through_decoder() {
        let secret = [0x33_u8; 32];
        let nsec = encode_nsec(&secret).expect("encode");
        assert!(nsec.starts_with("nsec1"));
        assert_eq!(decode_secret_input(&nsec), Some(secret));
    }

    #[test]
    fn hex_secret_is_accepted() {
        let secret = [0xAB_u8; 32];
        assert_eq!(decode_secret_input(&hex::encode(secret)), Some(secret));
        assert_eq!(decode_secret_input(&format!("  {}\n", hex::encode(secret))), Some(secret));
    }

    #[test]
    fn npub_is_not_a_secret() {
        let npub = encode_npub(&[0x01_u8; 32]).expect("encode");
        assert!(npub.starts_with("npub1"));
        assert_eq!(decode_secret_input(&npub), None);
        assert_eq!(decode_secret_input("deadbeef"), None);
    }

    #[test]
    fn generated_secrets_are_valid() {
        let secret = generate_secret();
        assert!(NostrSigner::from_secret(secret).is_ok());
    }
}
