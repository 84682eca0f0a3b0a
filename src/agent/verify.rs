//! Artifact Verification
//!
//! Checks a downloaded artifact against the manifest: size cap, SHA-256
//! digest, and (when configured) an RSA PKCS#1 v1.5 signature over that
//! digest. Expected values always come from the manifest entry; nothing
//! derived from the artifact or its side-files is ever trusted.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::Pkcs1v15Sign;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("artifact is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("signature required but the manifest entry carries none")]
    SignatureMissing,
    #[error("invalid signing public key: {0}")]
    InvalidPublicKey(String),
}

/// Verifies artifact bytes against manifest-supplied expectations.
pub struct Verifier {
    max_artifact_size: usize,
    signature_required: bool,
    public_key: Option<RsaPublicKey>,
}

impl Verifier {
    /// Build a verifier. The PEM key is parsed eagerly so a bad key is a
    /// startup error, not a per-update one. Both SubjectPublicKeyInfo
    /// (`BEGIN PUBLIC KEY`) and PKCS#1 (`BEGIN RSA PUBLIC KEY`) PEM are
    /// accepted.
    pub fn new(
        max_artifact_size: usize,
        signature_required: bool,
        public_key_pem: Option<&str>,
    ) -> Result<Self, VerifyError> {
        let public_key = match public_key_pem {
            Some(pem) => Some(parse_public_key(pem)?),
            None => None,
        };
        Ok(Self {
            max_artifact_size,
            signature_required,
            public_key,
        })
    }

    /// Verify `bytes` against the expected digest and optional signature.
    ///
    /// Order matters: the size cap closes the window before any hashing, and
    /// the signature covers the SHA-256 digest that was just checked.
    pub fn verify(
        &self,
        bytes: &[u8],
        expected_sha256: &[u8; 32],
        signature: Option<&[u8]>,
    ) -> Result<(), VerifyError> {
        if bytes.len() > self.max_artifact_size {
            return Err(VerifyError::TooLarge {
                size: bytes.len(),
                limit: self.max_artifact_size,
            });
        }

        let digest: [u8; 32] = Sha256::digest(bytes).into();
        if &digest != expected_sha256 {
            return Err(VerifyError::DigestMismatch {
                expected: hex::encode(expected_sha256),
                actual: hex::encode(digest),
            });
        }

        match (signature, &self.public_key) {
            (Some(signature), Some(key)) => key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
                .map_err(|_| VerifyError::SignatureInvalid),
            (None, _) if self.signature_required => Err(VerifyError::SignatureMissing),
            _ => Ok(()),
        }
    }

    pub fn signature_required(&self) -> bool {
        self.signature_required
    }

    /// Hex-encoded SHA-256 of a byte buffer.
    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, VerifyError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| VerifyError::InvalidPublicKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::RsaPrivateKey;

    fn digest_of(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            Verifier::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_digest_match_and_mismatch() {
        let verifier = Verifier::new(1024, false, None).unwrap();
        let bytes = b"hello world";
        verifier.verify(bytes, &digest_of(bytes), None).unwrap();

        let mut wrong = digest_of(bytes);
        wrong[31] ^= 1;
        assert!(matches!(
            verifier.verify(bytes, &wrong, None),
            Err(VerifyError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_size_cap_checked_before_digest() {
        let verifier = Verifier::new(4, false, None).unwrap();
        let bytes = b"hello world";
        assert!(matches!(
            verifier.verify(bytes, &digest_of(bytes), None),
            Err(VerifyError::TooLarge { size: 11, limit: 4 })
        ));
    }

    #[test]
    fn test_signature_missing_when_required() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let verifier = Verifier::new(1024, true, Some(&pem)).unwrap();
        let bytes = b"artifact";
        assert!(matches!(
            verifier.verify(bytes, &digest_of(bytes), None),
            Err(VerifyError::SignatureMissing)
        ));
    }

    #[test]
    fn test_signature_round_trip_and_tamper() {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let pem = key
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let verifier = Verifier::new(1024, true, Some(&pem)).unwrap();

        let bytes = b"artifact bytes";
        let digest = digest_of(bytes);
        let signature = key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap();

        verifier.verify(bytes, &digest, Some(&signature)).unwrap();

        let mut bad = signature.clone();
        bad[0] ^= 0xff;
        assert!(matches!(
            verifier.verify(bytes, &digest, Some(&bad)),
            Err(VerifyError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_bad_pem_rejected_at_construction() {
        assert!(matches!(
            Verifier::new(1024, true, Some("not a pem")),
            Err(VerifyError::InvalidPublicKey(_))
        ));
    }
}
