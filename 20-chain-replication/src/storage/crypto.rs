//! Hybrid encryption at rest.
//!
//! Every stored value gets a fresh ChaCha20-Poly1305 key and nonce. That
//! 44-byte secret is wrapped with the engine's RSA public key (OAEP, SHA-256)
//! and prepended to the sealed envelope:
//!
//! ```text
//! blob     = wrapped(key || nonce) || chacha20poly1305(envelope)
//! envelope = [lead: u8][len: u48 BE][lead noise bytes][plaintext][trailing noise]
//! ```
//!
//! The wrapped prefix is exactly `modulus_bits / 8` bytes and the sealed
//! envelope carries a 16-byte authentication tag. Decryption is only needed by
//! out-of-band tooling, which holds the private key.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::StorageError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const LENGTH_FIELD: usize = 6;
const HEADER_LEN: usize = 1 + LENGTH_FIELD;
const TAG_LEN: usize = 16;
const MAX_PLAINTEXT: u64 = (1 << (8 * LENGTH_FIELD)) - 1;

/// Encrypts values and verifies value signatures with a public key.
#[derive(Debug, Clone)]
pub struct Sealer {
    public_key: RsaPublicKey,
    modulus_bits: usize,
}

impl Sealer {
    /// Fails when the key's modulus is not `modulus_bits` wide.
    pub fn new(public_key: RsaPublicKey, modulus_bits: usize) -> Result<Self, StorageError> {
        let actual = public_key.size() * 8;
        if actual != modulus_bits {
            return Err(StorageError::Key(format!(
                "public key modulus is {actual} bits, configured {modulus_bits}"
            )));
        }
        Ok(Self {
            public_key,
            modulus_bits,
        })
    }

    pub fn from_pem(pem: &str, modulus_bits: usize) -> Result<Self, StorageError> {
        Self::new(load_public_key(pem)?, modulus_bits)
    }

    /// Width of the wrapped-key prefix of every blob.
    pub fn wrapped_len(&self) -> usize {
        self.modulus_bits / 8
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        if plaintext.len() as u64 > MAX_PLAINTEXT {
            return Err(StorageError::Crypto(format!(
                "value of {} bytes does not fit the envelope",
                plaintext.len()
            )));
        }
        let mut rng = OsRng;

        let mut secret = [0u8; KEY_LEN + NONCE_LEN];
        rng.fill_bytes(&mut secret);
        let wrapped = self
            .public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), &secret)
            .map_err(|err| StorageError::Crypto(err.to_string()))?;

        let lead: u8 = rng.gen();
        let trail: u8 = rng.gen();
        let mut envelope = Vec::with_capacity(HEADER_LEN + lead as usize + plaintext.len() + trail as usize);
        envelope.push(lead);
        envelope.extend_from_slice(&(plaintext.len() as u64).to_be_bytes()[8 - LENGTH_FIELD..]);
        envelope.extend(noise(&mut rng, lead as usize));
        envelope.extend_from_slice(plaintext);
        envelope.extend(noise(&mut rng, trail as usize));
        let sealed = cipher(&secret)
            .encrypt(Nonce::from_slice(&secret[KEY_LEN..]), envelope.as_slice())
            .map_err(|err| StorageError::Crypto(err.to_string()))?;

        let mut blob = wrapped;
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Checks a signature produced by [`sign_value`] with the matching private key.
    pub fn verify(&self, value: &[u8], signature: &[u8]) -> bool {
        let digest = Sha256::digest(value);
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok()
    }
}

/// Reverses [`Sealer::seal`].
pub fn decrypt(private_key: &RsaPrivateKey, blob: &[u8], modulus_bits: usize) -> Result<Vec<u8>, StorageError> {
    let wrapped_len = modulus_bits / 8;
    if blob.len() < wrapped_len + HEADER_LEN + TAG_LEN {
        return Err(StorageError::Crypto("blob is shorter than its framing".to_string()));
    }
    let (wrapped, ciphertext) = blob.split_at(wrapped_len);

    let secret = private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|err| StorageError::Crypto(err.to_string()))?;
    if secret.len() != KEY_LEN + NONCE_LEN {
        return Err(StorageError::Crypto("unexpected wrapped secret length".to_string()));
    }

    let envelope = cipher(&secret)
        .decrypt(Nonce::from_slice(&secret[KEY_LEN..]), ciphertext)
        .map_err(|err| StorageError::Crypto(err.to_string()))?;
    if envelope.len() < HEADER_LEN {
        return Err(StorageError::Crypto("envelope is shorter than its header".to_string()));
    }

    let lead = envelope[0] as usize;
    let mut length = [0u8; 8];
    length[8 - LENGTH_FIELD..].copy_from_slice(&envelope[1..HEADER_LEN]);
    let length = u64::from_be_bytes(length) as usize;

    let start = HEADER_LEN + lead;
    let end = start
        .checked_add(length)
        .filter(|end| *end <= envelope.len())
        .ok_or_else(|| StorageError::Crypto("truncated envelope".to_string()))?;
    Ok(envelope[start..end].to_vec())
}

/// Signs the SHA-256 digest of `value` (PKCS#1 v1.5), as accepted by `restore`.
pub fn sign_value(private_key: &RsaPrivateKey, value: &[u8]) -> Result<Vec<u8>, StorageError> {
    let digest = Sha256::digest(value);
    private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|err| StorageError::Crypto(err.to_string()))
}

/// Accepts PKCS#1 (`RSA PUBLIC KEY`) or SPKI (`PUBLIC KEY`) PEM.
pub fn load_public_key(pem: &str) -> Result<RsaPublicKey, StorageError> {
    RsaPublicKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
        .map_err(|err| StorageError::Key(err.to_string()))
}

/// Accepts PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`) PEM.
pub fn load_private_key(pem: &str) -> Result<RsaPrivateKey, StorageError> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|err| StorageError::Key(err.to_string()))
}

/// PEM-encoded PKCS#1 key pair.
pub struct KeyPairPem {
    pub private_pem: String,
    pub public_pem: String,
}

pub fn generate_key_pair(modulus_bits: usize) -> Result<(RsaPrivateKey, RsaPublicKey), StorageError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, modulus_bits)
        .map_err(|err| StorageError::Key(err.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);
    Ok((private_key, public_key))
}

pub fn encode_key_pair(private_key: &RsaPrivateKey) -> Result<KeyPairPem, StorageError> {
    let private_pem = private_key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|err| StorageError::Key(err.to_string()))?;
    let public_pem = RsaPublicKey::from(private_key)
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|err| StorageError::Key(err.to_string()))?;
    Ok(KeyPairPem {
        private_pem: private_pem.to_string(),
        public_pem,
    })
}

fn noise(rng: &mut impl RngCore, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rng.fill_bytes(&mut bytes);
    bytes
}

fn cipher(secret: &[u8]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(&secret[..KEY_LEN]))
}
