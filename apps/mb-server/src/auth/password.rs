use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Stored as `pbkdf2-sha256:<rounds>:<salt>:<key>`, both binary fields
/// url-safe base64 without padding.
const SCHEME: &str = "pbkdf2-sha256";
const ROUNDS: u32 = 240_000;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let password = password.trim();
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = stretch(password.as_bytes(), &salt, ROUNDS);

    Ok(format!(
        "{SCHEME}:{ROUNDS}:{}:{}",
        URL_SAFE_NO_PAD.encode(salt),
        URL_SAFE_NO_PAD.encode(key)
    ))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let password = password.trim();
    if password.is_empty() {
        return false;
    }
    let Some((rounds, salt, expected)) = decode_stored(stored) else {
        return false;
    };
    let key = stretch(password.as_bytes(), &salt, rounds);
    key.ct_eq(expected.as_slice()).into()
}

/// The rounds count travels with the hash so old entries keep verifying
/// after the default changes.
fn decode_stored(stored: &str) -> Option<(u32, Vec<u8>, Vec<u8>)> {
    let mut fields = stored.split(':');
    if fields.next()? != SCHEME {
        return None;
    }
    let rounds: u32 = fields.next()?.parse().ok()?;
    let salt = URL_SAFE_NO_PAD.decode(fields.next()?).ok()?;
    let key = URL_SAFE_NO_PAD.decode(fields.next()?).ok()?;
    if fields.next().is_some() || rounds == 0 {
        return None;
    }
    Some((rounds, salt, key))
}

fn stretch(password: &[u8], salt: &[u8], rounds: u32) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password, salt, rounds, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let stored = hash_password("s3cret-Passw0rd!").unwrap();
        assert!(stored.starts_with("pbkdf2-sha256:240000:"));
        assert!(verify_password("s3cret-Passw0rd!", &stored));
        assert!(!verify_password("wrong", &stored));
    }

    #[test]
    fn every_hash_gets_its_own_salt() {
        let first = hash_password("same-input-A1!").unwrap();
        let second = hash_password("same-input-A1!").unwrap();
        assert_ne!(first, second);
        assert!(verify_password("same-input-A1!", &first));
        assert!(verify_password("same-input-A1!", &second));
    }

    #[test]
    fn empty_passwords_never_hash_or_verify() {
        assert!(hash_password("   ").is_err());
        let stored = hash_password("real-Passw0rd!").unwrap();
        assert!(!verify_password("", &stored));
    }

    #[test]
    fn mangled_entries_never_verify() {
        assert!(!verify_password("x", "not-a-hash"));
        assert!(!verify_password("x", "pbkdf2-sha256:abc:salt:key"));
        assert!(!verify_password("x", "pbkdf2-sha256:0:AAAA:AAAA"));
        assert!(!verify_password("x", "scrypt:240000:AAAA:AAAA"));
        assert!(!verify_password("x", "pbkdf2-sha256:240000:AAAA:AAAA:extra"));
    }

    #[test]
    fn rounds_count_is_read_from_the_entry() {
        // a low-rounds entry minted by hand still verifies
        let salt = [7u8; SALT_LEN];
        let key = stretch(b"legacy-Pass1!", &salt, 1000);
        let stored = format!(
            "{SCHEME}:1000:{}:{}",
            URL_SAFE_NO_PAD.encode(salt),
            URL_SAFE_NO_PAD.encode(key)
        );
        assert!(verify_password("legacy-Pass1!", &stored));
        assert!(!verify_password("other", &stored));
    }
}
