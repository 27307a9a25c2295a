pub mod logging;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Alphanumeric nonce of `len` characters.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// 16 random alphanumeric bytes for a plaintext frame prefix.
pub fn random_frame_prefix() -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut rng = rand::thread_rng();
    for b in out.iter_mut() {
        *b = rng.sample(Alphanumeric);
    }
    out
}

/// Seconds since the epoch as a string, as carried in callback parameters.
pub fn unix_timestamp() -> String {
    chrono::Utc::now().timestamp().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string() {
        let a = random_string(16);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, random_string(16));
    }

    #[test]
    fn test_random_frame_prefix_is_printable() {
        assert!(random_frame_prefix().iter().all(u8::is_ascii_alphanumeric));
    }
}
