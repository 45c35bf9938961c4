use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine,
};
use constant_time_eq::constant_time_eq;
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{ZeroizeOnDrop, Zeroizing};

/// AES-256 key length.
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
/// Entropy of a public secret key, in bytes (128 bits).
const PUBLIC_KEY_BYTES: usize = 16;

/// Lowest PBKDF2 work factor accepted for encryption or decryption.
pub const MIN_PBKDF2_ITERATIONS: u32 = 10_000;
/// Work factor used unless configured otherwise.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 100_000;
/// Envelopes claiming more rounds than this are treated as corrupt.
const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;

const ENVELOPE_VERSION: u8 = 1;
const MODE_MASTER: u8 = 0;
const MODE_PASSPHRASE: u8 = 1;
/// version(1) + mode(1) + iterations(4) + salt + nonce
const HEADER_LEN: usize = 2 + 4 + SALT_LEN + NONCE_LEN;

const PASSPHRASE_CHARSET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("master key must not be empty")]
    EmptyMasterKey,
    #[error("encryption failed")]
    Encryption,
    /// Corrupt data and a wrong key are indistinguishable.
    #[error("failed to decrypt secret")]
    Decryption,
}

/// Server-held key material. `cipher_key` is SHA-256 of the raw key and is used
/// directly when a secret has no passphrase; `raw` seeds the PBKDF2 salt.
#[derive(ZeroizeOnDrop)]
struct MasterKey {
    raw: Vec<u8>,
    cipher_key: [u8; KEY_LEN],
}

/// Stateless encryption, hashing and random generation for secrets.
///
/// Built once at startup from the master key and shared behind an `Arc`;
/// nothing in here mutates after construction.
pub struct CryptoEngine {
    master: MasterKey,
    iterations: u32,
}

impl CryptoEngine {
    pub fn new(master_key: &str) -> Result<Self, CryptoError> {
        if master_key.trim().is_empty() {
            return Err(CryptoError::EmptyMasterKey);
        }
        let raw = master_key.as_bytes().to_vec();
        let cipher_key: [u8; KEY_LEN] = Sha256::digest(&raw).into();
        Ok(Self {
            master: MasterKey { raw, cipher_key },
            iterations: DEFAULT_PBKDF2_ITERATIONS,
        })
    }

    /// Override the PBKDF2 work factor. Values below the floor are raised to it.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.clamp(MIN_PBKDF2_ITERATIONS, MAX_PBKDF2_ITERATIONS);
        self
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Encrypt `plaintext` with AES-256-GCM and return a base64 envelope that
    /// carries everything `decrypt` needs apart from the passphrase.
    pub fn encrypt(
        &self,
        plaintext: &str,
        passphrase: Option<&str>,
    ) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let (mode, iterations, salt, key) = match passphrase {
            Some(p) => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                let key = self.derive_key(p, &salt, self.iterations);
                (MODE_PASSPHRASE, self.iterations, salt, key)
            }
            None => (
                MODE_MASTER,
                0,
                [0u8; SALT_LEN],
                Zeroizing::new(self.master.cipher_key),
            ),
        };

        let cipher =
            Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CryptoError::Encryption)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.push(mode);
        envelope.extend_from_slice(&iterations.to_be_bytes());
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(envelope))
    }

    /// Reverse of [`encrypt`](Self::encrypt). The passphrase must be present
    /// exactly when it was present at encryption time.
    pub fn decrypt(&self, encoded: &str, passphrase: Option<&str>) -> Result<String, CryptoError> {
        let envelope = STANDARD.decode(encoded).map_err(|_| CryptoError::Decryption)?;
        if envelope.len() <= HEADER_LEN || envelope[0] != ENVELOPE_VERSION {
            return Err(CryptoError::Decryption);
        }

        let mode = envelope[1];
        let iterations = u32::from_be_bytes([envelope[2], envelope[3], envelope[4], envelope[5]]);
        let salt = &envelope[6..6 + SALT_LEN];
        let nonce = &envelope[6 + SALT_LEN..HEADER_LEN];
        let ciphertext = &envelope[HEADER_LEN..];

        let key = match (mode, passphrase) {
            (MODE_MASTER, None) => Zeroizing::new(self.master.cipher_key),
            (MODE_PASSPHRASE, Some(p))
                if (MIN_PBKDF2_ITERATIONS..=MAX_PBKDF2_ITERATIONS).contains(&iterations) =>
            {
                self.derive_key(p, salt, iterations)
            }
            _ => return Err(CryptoError::Decryption),
        };

        let cipher =
            Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CryptoError::Decryption)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }

    /// PBKDF2-HMAC-SHA256 with `master ‖ salt` as salt material.
    fn derive_key(
        &self,
        passphrase: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Zeroizing<[u8; KEY_LEN]> {
        let mut salt_material =
            Zeroizing::new(Vec::with_capacity(self.master.raw.len() + salt.len()));
        salt_material.extend_from_slice(&self.master.raw);
        salt_material.extend_from_slice(salt);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(
            passphrase.as_bytes(),
            &salt_material,
            iterations,
            &mut key[..],
        );
        key
    }
}

/// Fresh URL-safe public identifier with 128 bits of entropy.
pub fn generate_key() -> String {
    let mut bytes = [0u8; PUBLIC_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Lowercase hex SHA-256. Only used for passphrase verification.
pub fn hash(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

pub fn verify_passphrase(candidate: &str, stored_hash: &str) -> bool {
    constant_time_eq(hash(candidate).as_bytes(), stored_hash.as_bytes())
}

/// Random passphrase suggestion drawn uniformly from a fixed alphabet.
pub fn generate_passphrase(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| PASSPHRASE_CHARSET[rng.gen_range(0..PASSPHRASE_CHARSET.len())] as char)
        .collect()
}
