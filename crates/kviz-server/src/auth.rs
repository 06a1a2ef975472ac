use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes behind an opaque credential token.
const TOKEN_BYTES: usize = 32;

/// Salt length for password hashes.
const SALT_BYTES: usize = 16;

/// True iff `pin` has the canonical shape: exactly six ASCII digits.
pub fn is_valid_pin(pin: &str) -> bool {
    pin.len() == 6 && pin.bytes().all(|b| b.is_ascii_digit())
}

/// Draw a fresh 6-digit PIN, resampling while `is_taken` reports a
/// collision with the active set. The store's unique column remains the
/// authoritative check at insert time.
pub fn generate_pin<F: Fn(&str) -> bool>(is_taken: F) -> String {
    let mut rng = rand::rng();
    loop {
        let pin = format!("{}", rng.random_range(100_000..=999_999));
        if !is_taken(&pin) {
            return pin;
        }
    }
}

/// An opaque 64-hex credential token. Never parsed, only compared.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Hash a moderator password with a random salt. The stored form is
/// `<salt-hex>:<mac-hex>` where the MAC is HMAC-SHA256 keyed by the salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    rand::rng().fill(&mut salt[..]);
    let mut mac = HmacSha256::new_from_slice(&salt).expect("HMAC accepts any key length");
    mac.update(password.as_bytes());
    let digest = mac.finalize().into_bytes();
    format!("{}:{}", hex::encode(salt), hex::encode(digest))
}

/// Verify a password against a stored hash in constant time.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt_hex, mac_hex)) = stored.split_once(':') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(mac_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(&salt) else {
        return false;
    };
    mac.update(password.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Constant-time equality for opaque tokens.
pub fn tokens_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
