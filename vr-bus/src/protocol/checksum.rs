//! Header and body checksums.
//!
//! Checksums use Aegis128L AEAD with an all-zero key and nonce: the data to
//! checksum is passed as associated data (no secret message), and the
//! resulting authentication tag is the checksum. This gives a 128-bit,
//! hardware-accelerated integrity check without needing a real key.

use aegis::aegis128l::Aegis128L;

const ZERO_KEY: [u8; 16] = [0u8; 16];
const ZERO_NONCE: [u8; 16] = [0u8; 16];

/// Compute the 128-bit checksum of `data`.
pub fn checksum(data: &[u8]) -> u128 {
    let cipher = Aegis128L::<16>::new(&ZERO_KEY, &ZERO_NONCE);
    let (_, tag) = cipher.encrypt(&[], data);
    u128::from_le_bytes(tag)
}
