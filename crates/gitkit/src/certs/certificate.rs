use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey};

/// Wrapper around a key id to avoid mixing up with other random strings
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct KeyId(Box<str>);

impl KeyId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        Self(Box::from(value))
    }
}

impl From<String> for KeyId {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}

impl Borrow<str> for KeyId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed X.509 signing certificate. Cheap to clone.
#[derive(Clone)]
pub struct Certificate {
    inner: Arc<CertificateInner>,
}

struct CertificateInner {
    pem: Box<str>,
    key: DecodingKey,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("pem_len", &self.inner.pem.len())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.pem == other.inner.pem
    }
}

impl Eq for Certificate {}

impl Certificate {
    /// Parses a PEM encoded certificate (or RSA public key), keeping its public key.
    pub fn from_pem(pem: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())?;

        Ok(Self {
            inner: Arc::new(CertificateInner {
                pem: Box::from(pem),
                key,
            }),
        })
    }

    pub fn pem(&self) -> &str {
        &self.inner.pem
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.inner.key
    }

    /// Checks a raw RSA/SHA-256 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        // jsonwebtoken only takes the signature in its encoded form
        let signature = URL_SAFE_NO_PAD.encode(signature);

        jsonwebtoken::crypto::verify(&signature, message, &self.inner.key, Algorithm::RS256)
            .unwrap_or(false)
    }

    /// Whether both handles point at the same parsed certificate.
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
