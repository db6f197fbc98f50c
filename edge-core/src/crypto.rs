//! RSA sign/verify/encrypt/decrypt facade over the device key pair.
//!
//! Signatures are PSS over SHA-256, encryption is OAEP over SHA-256,
//! and everything crosses the wire base64-encoded. Errors stay
//! categorical; neither key bytes nor plaintext ever end up in an error
//! message.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::{Error, Result};

/// The device's pinned private key plus the id it is pinned to.
#[derive(Debug)]
pub struct DeviceKeys {
    private: RsaPrivateKey,
    did: String,
}

impl DeviceKeys {
    /// Load `Cert/{DID}_private_key.pem`. A missing or malformed key is
    /// fatal to bring-up; the caller does not get a degraded mode.
    pub fn load(cert_dir: impl AsRef<Path>, did: &str) -> Result<Self> {
        let path = cert_dir
            .as_ref()
            .join(format!("{did}_private_key.pem"));
        let pem = std::fs::read_to_string(&path).map_err(|_| {
            Error::Crypto(format!("private key file missing: {}", path.display()))
        })?;
        Self::from_pem(did, &pem)
    }

    pub fn from_pem(did: &str, pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| Error::Crypto("malformed private key PEM".into()))?;
        Ok(Self {
            private,
            did: did.to_string(),
        })
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// PEM of the public half, handy for peers and tests.
    pub fn public_key_pem(&self) -> Result<String> {
        RsaPublicKey::from(&self.private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| Error::Crypto("cannot encode public key".into()))
    }

    /// PSS/SHA-256 signature of the UTF-8 plaintext, base64-encoded.
    pub fn sign(&self, plaintext: &str) -> Result<String> {
        let key = SigningKey::<Sha256>::new(self.private.clone());
        let sig = key
            .try_sign_with_rng(&mut OsRng, plaintext.as_bytes())
            .map_err(|_| Error::Crypto("signing failed".into()))?;
        Ok(BASE64.encode(sig.to_bytes()))
    }

    /// Verify a base64 PSS signature against a peer public key PEM.
    /// Returns `Ok(false)` for a well-formed but wrong signature.
    pub fn verify(plaintext: &str, signature_b64: &str, public_key_pem: &str) -> Result<bool> {
        let public = parse_public_pem(public_key_pem)?;
        let raw = BASE64
            .decode(signature_b64.trim())
            .map_err(|_| Error::Crypto("signature is not valid base64".into()))?;
        let sig = match Signature::try_from(raw.as_slice()) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        let key = VerifyingKey::<Sha256>::new(public);
        Ok(key.verify(plaintext.as_bytes(), &sig).is_ok())
    }

    /// OAEP/SHA-256 decryption of a base64 ciphertext with the pinned
    /// private key.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let raw = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| Error::Crypto("ciphertext is not valid base64".into()))?;
        let plain = self
            .private
            .decrypt(Oaep::new::<Sha256>(), &raw)
            .map_err(|_| Error::Crypto("decryption failed".into()))?;
        String::from_utf8(plain).map_err(|_| Error::Crypto("plaintext is not UTF-8".into()))
    }

    /// OAEP/SHA-256 encryption to a peer public key PEM, base64 out.
    pub fn encrypt(plaintext: &str, public_key_pem: &str) -> Result<String> {
        let public = parse_public_pem(public_key_pem)?;
        let cipher = public
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".into()))?;
        Ok(BASE64.encode(cipher))
    }
}

fn parse_public_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|_| Error::Crypto("malformed public key PEM".into()))
}
