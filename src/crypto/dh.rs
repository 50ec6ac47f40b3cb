use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::Error;

/// Size in bytes of DH public keys and shared secrets.
pub const DH_KEY_SIZE: usize = 128;

// RFC 2409 group 2: 1024-bit MODP prime, generator 2. The same constant
// every deployed RTMFP peer uses.
const DH1024_PRIME: [u8; DH_KEY_SIZE] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, //
    0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2, 0x34, //
    0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, //
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, //
    0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, //
    0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD, //
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, //
    0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37, //
    0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, //
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, //
    0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, //
    0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED, //
    0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, //
    0xAE, 0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6, //
    0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81, //
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

/// Ephemeral Diffie-Hellman key pair for one endpoint.
///
/// The key pair is fixed for the lifetime of the endpoint: every
/// handshake (server or peer) presents the same public key, which is
/// what makes the derived peer id stable.
pub struct DiffieHellman {
    private_key: BigUint,
    public_key: [u8; DH_KEY_SIZE],
}

impl DiffieHellman {
    /// Generate a fresh key pair. The exponent always comes from the OS
    /// RNG, never the seedable one.
    pub fn generate() -> Self {
        let prime = BigUint::from_bytes_be(&DH1024_PRIME);
        let generator = BigUint::from(2u8);

        let mut exponent_bytes = [0u8; DH_KEY_SIZE];
        OsRng.fill_bytes(&mut exponent_bytes);
        // Clear the top bit so the exponent stays below the prime.
        exponent_bytes[0] &= 0x7F;

        let private_key = BigUint::from_bytes_be(&exponent_bytes);
        exponent_bytes.zeroize();

        let public = generator.modpow(&private_key, &prime);
        let public_key = left_pad(&public.to_bytes_be());

        Self {
            private_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> &[u8; DH_KEY_SIZE] {
        &self.public_key
    }

    /// Compute the 128-byte shared secret from the peer's public key.
    pub fn shared_secret(&self, far_public_key: &[u8]) -> Result<[u8; DH_KEY_SIZE], Error> {
        if far_public_key.is_empty() || far_public_key.len() > DH_KEY_SIZE {
            return Err(Error::CryptoFailure(format!(
                "far public key size {}",
                far_public_key.len()
            )));
        }

        let prime = BigUint::from_bytes_be(&DH1024_PRIME);
        let far = BigUint::from_bytes_be(far_public_key);

        // 0, 1 and p-1 would collapse the secret.
        let one = BigUint::from(1u8);
        if far <= one || far >= &prime - &one {
            return Err(Error::CryptoFailure("degenerate far public key".into()));
        }

        let secret = far.modpow(&self.private_key, &prime);
        Ok(left_pad(&secret.to_bytes_be()))
    }
}

impl std::fmt::Debug for DiffieHellman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffieHellman").finish()
    }
}

fn left_pad(bytes: &[u8]) -> [u8; DH_KEY_SIZE] {
    debug_assert!(bytes.len() <= DH_KEY_SIZE);
    let mut out = [0u8; DH_KEY_SIZE];
    out[DH_KEY_SIZE - bytes.len()..].copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn two_parties_agree() {
        let a = DiffieHellman::generate();
        let b = DiffieHellman::generate();

        let s_ab = a.shared_secret(b.public_key()).unwrap();
        let s_ba = b.shared_secret(a.public_key()).unwrap();

        assert_eq!(s_ab, s_ba);
    }

    #[test]
    fn degenerate_keys_rejected() {
        let a = DiffieHellman::generate();

        assert!(a.shared_secret(&[]).is_err());
        assert!(a.shared_secret(&[0u8; DH_KEY_SIZE]).is_err());
        assert!(a.shared_secret(&[1]).is_err());
        assert!(a.shared_secret(&DH1024_PRIME).is_err());
    }

    #[test]
    fn public_key_is_full_width() {
        let a = DiffieHellman::generate();
        assert_eq!(a.public_key().len(), DH_KEY_SIZE);
    }
}
