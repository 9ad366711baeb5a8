use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the hex digest kept for log correlation.
const HASH_PREFIX_LEN: usize = 16;

/// Salted HMAC-SHA256 of an external user id, truncated for log fields.
///
/// Raw author ids (and message content) never appear in logs or metrics;
/// this hash is stable for a given salt so events can still be correlated.
pub fn user_hash(salt: &str, user_id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(user_id.as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    digest[..HASH_PREFIX_LEN].to_string()
}
