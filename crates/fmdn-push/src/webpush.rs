//! # Web Push Content Decryption
//!
//! Key generation for the web push subscription and `aesgcm` content
//! decryption of inbound data messages.
//!
//! ## Key Derivation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ecdh    = P-256 ECDH(our private key, sender public key from dh=)      │
//! │  ikm     = HKDF(salt = auth secret, ecdh, "Content-Encoding: auth\0")   │
//! │                                                                         │
//! │  context = "P-256\0" ‖ len ‖ receiver pub ‖ len ‖ sender pub            │
//! │  key     = HKDF(salt, ikm, "Content-Encoding: aesgcm\0" ‖ context)  16B │
//! │  nonce   = HKDF(salt, ikm, "Content-Encoding: nonce\0"  ‖ context)  12B │
//! │                                                                         │
//! │  record i: AES-128-GCM(key, nonce XOR i) over 4096 + 16 bytes           │
//! │            plaintext = [pad len: u16 BE][pad][data]                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use fmdn_core::WebPushKeys;
use hkdf::Hkdf;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{PushError, PushResult};

/// Plaintext bytes per record.
const RECORD_SIZE: usize = 4096;

/// AES-GCM authentication tag length.
const TAG_LEN: usize = 16;

/// Length of the padding-length prefix of each record.
const PAD_PREFIX_LEN: usize = 2;

const SALT_LEN: usize = 16;
const AUTH_SECRET_LEN: usize = 16;

// =============================================================================
// Base64
// =============================================================================

/// Decodes base64 in either alphabet, with or without padding.
pub(crate) fn decode_b64(value: &str) -> PushResult<Vec<u8>> {
    let trimmed = value.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| PushError::KeyMaterial(format!("invalid base64: {}", e)))
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

// =============================================================================
// Key Generation
// =============================================================================

fn uncompressed(public_key: &PublicKey) -> Vec<u8> {
    public_key.to_encoded_point(false).as_bytes().to_vec()
}

/// Generates the key material of a new web push subscription.
pub fn generate_keys() -> PushResult<WebPushKeys> {
    let secret_key = SecretKey::random(&mut OsRng);
    let public = uncompressed(&secret_key.public_key());
    let private = secret_key
        .to_pkcs8_der()
        .map_err(|e| PushError::KeyMaterial(format!("pkcs8 encode failed: {}", e)))?;

    let mut auth_secret = [0u8; AUTH_SECRET_LEN];
    OsRng.fill_bytes(&mut auth_secret);

    Ok(WebPushKeys {
        public: encode_b64(&public),
        private: encode_b64(private.as_bytes()),
        secret: encode_b64(&auth_secret),
    })
}

// =============================================================================
// Decryptor
// =============================================================================

/// Decrypts `aesgcm` web push content addressed to one subscription.
#[derive(Clone)]
pub struct WebPushDecryptor {
    secret_key: SecretKey,
    public_key: Vec<u8>,
    auth_secret: Vec<u8>,
}

impl std::fmt::Debug for WebPushDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebPushDecryptor")
            .field("public_key", &encode_b64(&self.public_key))
            .finish_non_exhaustive()
    }
}

impl WebPushDecryptor {
    /// Loads the subscription keys.
    ///
    /// The private key is PKCS#8 DER; a bare 32-byte scalar is accepted too.
    pub fn from_keys(keys: &WebPushKeys) -> PushResult<Self> {
        if !keys.is_complete() {
            return Err(PushError::KeyMaterial("web push keys are incomplete".into()));
        }

        let private = decode_b64(&keys.private)?;
        let secret_key = if private.len() == 32 {
            SecretKey::from_slice(&private)
        } else {
            SecretKey::from_pkcs8_der(&private).map_err(|_| p256::elliptic_curve::Error)
        }
        .map_err(|_| PushError::KeyMaterial("invalid private key".into()))?;

        let public_key = uncompressed(&secret_key.public_key());
        let auth_secret = decode_b64(&keys.secret)?;
        if auth_secret.len() != AUTH_SECRET_LEN {
            return Err(PushError::KeyMaterial(format!(
                "auth secret must be {} bytes, got {}",
                AUTH_SECRET_LEN,
                auth_secret.len()
            )));
        }

        Ok(WebPushDecryptor {
            secret_key,
            public_key,
            auth_secret,
        })
    }

    /// Uncompressed public key of the subscription.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Decrypts one message.
    ///
    /// `crypto_key` is the sender public key (the `dh=` value) and `salt` the
    /// `salt=` value, both base64url.
    pub fn decrypt(&self, crypto_key: &str, salt: &str, ciphertext: &[u8]) -> PushResult<Vec<u8>> {
        let sender_public = decode_b64(crypto_key)?;
        let salt = decode_b64(salt)?;
        if salt.len() != SALT_LEN {
            return Err(PushError::Decrypt(format!("salt must be {} bytes", SALT_LEN)));
        }

        let sender = PublicKey::from_sec1_bytes(&sender_public)
            .map_err(|_| PushError::Decrypt("invalid sender public key".into()))?;
        let shared = p256::ecdh::diffie_hellman(self.secret_key.to_nonzero_scalar(), sender.as_affine());

        let (key, nonce) = derive_key_and_nonce(
            shared.raw_secret_bytes().as_slice(),
            &self.auth_secret,
            &salt,
            &self.public_key,
            &sender_public,
        )?;
        decrypt_records(&key, &nonce, ciphertext)
    }
}

fn derive_key_and_nonce(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    salt: &[u8],
    receiver_public: &[u8],
    sender_public: &[u8],
) -> PushResult<([u8; 16], [u8; 12])> {
    let mut ikm = [0u8; 32];
    Hkdf::<Sha256>::new(Some(auth_secret), ecdh_secret)
        .expand(b"Content-Encoding: auth\0", &mut ikm)
        .map_err(|e| PushError::Decrypt(e.to_string()))?;

    let mut context = Vec::with_capacity(6 + 4 + receiver_public.len() + sender_public.len());
    context.extend_from_slice(b"P-256\0");
    context.extend_from_slice(&(receiver_public.len() as u16).to_be_bytes());
    context.extend_from_slice(receiver_public);
    context.extend_from_slice(&(sender_public.len() as u16).to_be_bytes());
    context.extend_from_slice(sender_public);

    let hkdf = Hkdf::<Sha256>::new(Some(salt), &ikm);

    let mut key = [0u8; 16];
    let key_info = [b"Content-Encoding: aesgcm\0".as_slice(), context.as_slice()].concat();
    hkdf.expand(&key_info, &mut key)
        .map_err(|e| PushError::Decrypt(e.to_string()))?;

    let mut nonce = [0u8; 12];
    let nonce_info = [b"Content-Encoding: nonce\0".as_slice(), context.as_slice()].concat();
    hkdf.expand(&nonce_info, &mut nonce)
        .map_err(|e| PushError::Decrypt(e.to_string()))?;

    Ok((key, nonce))
}

fn record_iv(nonce: &[u8; 12], counter: u64) -> [u8; 12] {
    let mut iv = *nonce;
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&nonce[4..]);
    let mixed = u64::from_be_bytes(tail) ^ counter;
    iv[4..].copy_from_slice(&mixed.to_be_bytes());
    iv
}

fn decrypt_records(key: &[u8; 16], nonce: &[u8; 12], ciphertext: &[u8]) -> PushResult<Vec<u8>> {
    if ciphertext.is_empty() {
        return Err(PushError::Decrypt("empty ciphertext".into()));
    }
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|e| PushError::Decrypt(e.to_string()))?;

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    for (counter, record) in ciphertext.chunks(RECORD_SIZE + TAG_LEN).enumerate() {
        let iv = record_iv(nonce, counter as u64);
        let block = cipher
            .decrypt(Nonce::from_slice(&iv), record)
            .map_err(|_| PushError::Decrypt(format!("record {} failed authentication", counter)))?;
        plaintext.extend_from_slice(unpad(&block)?);
    }
    Ok(plaintext)
}

fn unpad(block: &[u8]) -> PushResult<&[u8]> {
    if block.len() < PAD_PREFIX_LEN {
        return Err(PushError::Decrypt("record shorter than padding prefix".into()));
    }
    let pad = u16::from_be_bytes([block[0], block[1]]) as usize;
    let start = PAD_PREFIX_LEN + pad;
    if start > block.len() {
        return Err(PushError::Decrypt("padding exceeds record".into()));
    }
    if block[PAD_PREFIX_LEN..start].iter().any(|b| *b != 0) {
        return Err(PushError::Decrypt("non-zero padding".into()));
    }
    Ok(&block[start..])
}

// =============================================================================
// Test Sealing
// =============================================================================

/// Encrypts `plaintext` for a subscription, as a push server would.
///
/// Returns `(dh, salt, ciphertext)` with `dh` and `salt` base64url.
#[cfg(test)]
pub(crate) fn seal(keys: &WebPushKeys, plaintext: &[u8]) -> (String, String, Vec<u8>) {
    let receiver_public = decode_b64(&keys.public).unwrap();
    let auth_secret = decode_b64(&keys.secret).unwrap();
    let receiver = PublicKey::from_sec1_bytes(&receiver_public).unwrap();

    let ephemeral = SecretKey::random(&mut OsRng);
    let sender_public = uncompressed(&ephemeral.public_key());
    let shared = p256::ecdh::diffie_hellman(ephemeral.to_nonzero_scalar(), receiver.as_affine());

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let (key, nonce) = derive_key_and_nonce(
        shared.raw_secret_bytes().as_slice(),
        &auth_secret,
        &salt,
        &receiver_public,
        &sender_public,
    )
    .unwrap();

    let cipher = Aes128Gcm::new_from_slice(&key).unwrap();
    let mut ciphertext = Vec::new();
    for (counter, chunk) in plaintext.chunks(RECORD_SIZE - PAD_PREFIX_LEN).enumerate() {
        let mut record = vec![0u8; PAD_PREFIX_LEN];
        record.extend_from_slice(chunk);
        let iv = record_iv(&nonce, counter as u64);
        ciphertext.extend(cipher.encrypt(Nonce::from_slice(&iv), record.as_slice()).unwrap());
    }

    (encode_b64(&sender_public), encode_b64(&salt), ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_have_expected_sizes() {
        let keys = generate_keys().unwrap();
        assert_eq!(decode_b64(&keys.public).unwrap().len(), 65);
        assert_eq!(decode_b64(&keys.secret).unwrap().len(), 16);
        assert!(!keys.public.contains('='));

        let decryptor = WebPushDecryptor::from_keys(&keys).unwrap();
        assert_eq!(encode_b64(decryptor.public_key()), keys.public);
    }

    #[test]
    fn test_decrypt_sealed_message() {
        let keys = generate_keys().unwrap();
        let decryptor = WebPushDecryptor::from_keys(&keys).unwrap();

        let body = br#"{"data":{"hello":"world"}}"#;
        let (dh, salt, ciphertext) = seal(&keys, body);

        let plaintext = decryptor.decrypt(&dh, &salt, &ciphertext).unwrap();
        assert_eq!(plaintext, body);
    }

    #[test]
    fn test_decrypt_multi_record_message() {
        let keys = generate_keys().unwrap();
        let decryptor = WebPushDecryptor::from_keys(&keys).unwrap();

        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (dh, salt, ciphertext) = seal(&keys, &body);
        assert!(ciphertext.len() > RECORD_SIZE + TAG_LEN);

        assert_eq!(decryptor.decrypt(&dh, &salt, &ciphertext).unwrap(), body);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let keys = generate_keys().unwrap();
        let decryptor = WebPushDecryptor::from_keys(&keys).unwrap();

        let (dh, salt, mut ciphertext) = seal(&keys, b"payload");
        ciphertext[3] ^= 0x01;

        assert!(matches!(
            decryptor.decrypt(&dh, &salt, &ciphertext),
            Err(PushError::Decrypt(_))
        ));
    }

    #[test]
    fn test_wrong_subscription_fails() {
        let keys = generate_keys().unwrap();
        let other = WebPushDecryptor::from_keys(&generate_keys().unwrap()).unwrap();

        let (dh, salt, ciphertext) = seal(&keys, b"payload");
        assert!(other.decrypt(&dh, &salt, &ciphertext).is_err());
    }

    #[test]
    fn test_incomplete_keys_rejected() {
        let mut keys = generate_keys().unwrap();
        keys.secret.clear();
        assert!(matches!(
            WebPushDecryptor::from_keys(&keys),
            Err(PushError::KeyMaterial(_))
        ));
    }

    #[test]
    fn test_padding_is_stripped() {
        let mut block = vec![0x00, 0x03, 0, 0, 0];
        block.extend_from_slice(b"data");
        assert_eq!(unpad(&block).unwrap(), b"data");

        let bad = vec![0x00, 0x05, 0, 0];
        assert!(unpad(&bad).is_err());
    }
}
