//! Verification of identity toolkit ID tokens.
use std::fmt;

use axum::extract::FromRequestParts;
use http::StatusCode;
use http::request::Parts;
use serde::de::DeserializeOwned;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::certs::{CertError, CertificateSource};
use crate::segment::decode_segment;

/// The only signing algorithm identity toolkit tokens use.
const RS256: &str = "RS256";

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("no audiences given to verify the token against")]
    MissingAudience,
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("unsupported token algorithm {0:?}, expected RS256")]
    InvalidAlgorithm(Box<str>),
    #[error("token issued by unexpected issuer {0:?}")]
    InvalidIssuer(Box<str>),
    #[error("token issued for unexpected audience {0:?}")]
    InvalidAudience(Box<str>),
    #[error("token has expired")]
    Expired,
    #[error("token signing key not found")]
    KeyNotFound(#[source] CertError),
    #[error("invalid token signature")]
    InvalidSignature,
}

/// A verified ID token.
///
/// Only ever built by [`verify_token`], after every check has passed.
#[derive(Clone, PartialEq)]
pub struct Token {
    issuer: Box<str>,
    audience: Box<str>,
    /// Unix seconds, kept as sent.
    issued_at: i64,
    expire_at: i64,
    local_id: Box<str>,
    email: Option<Box<str>>,
    email_verified: bool,
    provider_id: Option<Box<str>>,
    display_name: Option<Box<str>>,
    photo_url: Option<Box<str>>,
    token_string: Box<str>,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // the raw token is a bearer credential, keep it out of logs
        f.debug_struct("Token")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("issued_at", &self.issued_at)
            .field("expire_at", &self.expire_at)
            .field("local_id", &self.local_id)
            .field("email", &self.email)
            .field("email_verified", &self.email_verified)
            .field("provider_id", &self.provider_id)
            .field("display_name", &self.display_name)
            .field("photo_url", &self.photo_url)
            .finish_non_exhaustive()
    }
}

impl Token {
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// Saturates at the bounds of [`OffsetDateTime`] for out of range claims.
    pub fn issued_at(&self) -> OffsetDateTime {
        saturating_datetime(self.issued_at)
    }

    pub fn issued_at_unix(&self) -> i64 {
        self.issued_at
    }

    pub fn expire_at(&self) -> OffsetDateTime {
        saturating_datetime(self.expire_at)
    }

    pub fn expire_at_unix(&self) -> i64 {
        self.expire_at
    }

    /// The user's id within the project.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn email_verified(&self) -> bool {
        self.email_verified
    }

    /// The identity provider the user signed in with, i.e `google.com`.
    pub fn provider_id(&self) -> Option<&str> {
        self.provider_id.as_deref()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn photo_url(&self) -> Option<&str> {
        self.photo_url.as_deref()
    }

    /// The raw token this was verified from, for forwarding to the account api.
    pub fn token_string(&self) -> &str {
        &self.token_string
    }

    pub fn expired(&self) -> bool {
        is_expired(self.expire_at)
    }
}

fn is_expired(expire_at: i64) -> bool {
    expire_at < OffsetDateTime::now_utc().unix_timestamp()
}

fn saturating_datetime(unix_secs: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix_secs).unwrap_or_else(|_| {
        if unix_secs < 0 {
            PrimitiveDateTime::MIN.assume_utc()
        } else {
            PrimitiveDateTime::MAX.assume_utc()
        }
    })
}

#[derive(serde::Deserialize)]
struct Header {
    #[serde(default)]
    alg: Box<str>,
    #[serde(default)]
    kid: Box<str>,
}

/// The token payload, as sent. Several claims have shown up under more than one name
/// over time, so all of them are accepted.
#[derive(Default, serde::Deserialize)]
#[serde(default)]
struct RawClaims {
    iss: Box<str>,
    aud: Box<str>,
    iat: i64,
    exp: i64,
    user_id: Option<Box<str>>,
    sub: Option<Box<str>>,
    email: Option<Box<str>>,
    verified: Option<bool>,
    email_verified: Option<bool>,
    provider_id: Option<Box<str>>,
    #[serde(rename = "providerId")]
    provider_id_camel: Option<Box<str>>,
    display_name: Option<Box<str>>,
    name: Option<Box<str>>,
    photo_url: Option<Box<str>>,
    picture: Option<Box<str>>,
}

struct Claims {
    issuer: Box<str>,
    audience: Box<str>,
    issued_at: i64,
    expire_at: i64,
    local_id: Box<str>,
    email: Option<Box<str>>,
    email_verified: bool,
    provider_id: Option<Box<str>>,
    display_name: Option<Box<str>>,
    photo_url: Option<Box<str>>,
}

impl From<RawClaims> for Claims {
    fn from(raw: RawClaims) -> Self {
        Self {
            issued_at: raw.iat,
            expire_at: raw.exp,
            issuer: raw.iss,
            audience: raw.aud,
            local_id: raw.user_id.or(raw.sub).unwrap_or_default(),
            email: raw.email,
            email_verified: raw.verified.or(raw.email_verified).unwrap_or(false),
            provider_id: raw.provider_id.or(raw.provider_id_camel),
            display_name: raw.display_name.or(raw.name),
            photo_url: raw.photo_url.or(raw.picture),
        }
    }
}

fn decode_json<T: DeserializeOwned>(segment: &str, what: &'static str) -> Result<T, VerifyError> {
    let bytes = decode_segment(segment).map_err(|_| VerifyError::Malformed(what))?;
    serde_json::from_slice(&bytes).map_err(|_| VerifyError::Malformed(what))
}

/// Verifies a compact ID token, returning the verified [`Token`].
///
/// Checks run in a fixed order, and the first failing check decides the error: structure,
/// issuer (skipped if `issuers` is empty), audience, expiry, algorithm, key lookup and
/// finally the signature. A [`Token`] is never returned unless the signature checks out.
pub async fn verify_token<C>(
    token: &str,
    audiences: &[&str],
    issuers: &[&str],
    certs: &C,
) -> Result<Token, VerifyError>
where
    C: CertificateSource,
{
    if audiences.is_empty() {
        return Err(VerifyError::MissingAudience);
    }

    let mut segments = token.split('.');
    let (Some(header_segment), Some(claims_segment), Some(signature_segment), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(VerifyError::Malformed("expected 3 dot separated segments"));
    };

    let raw_claims: RawClaims = decode_json(claims_segment, "invalid payload segment")?;
    let claims = Claims::from(raw_claims);

    if !issuers.is_empty() && !issuers.contains(&&*claims.issuer) {
        return Err(VerifyError::InvalidIssuer(claims.issuer));
    }

    if !audiences.contains(&&*claims.audience) {
        return Err(VerifyError::InvalidAudience(claims.audience));
    }

    if is_expired(claims.expire_at) {
        return Err(VerifyError::Expired);
    }

    let header: Header = decode_json(header_segment, "invalid header segment")?;

    if &*header.alg != RS256 {
        return Err(VerifyError::InvalidAlgorithm(header.alg));
    }

    let cert = certs
        .certificate(&header.kid)
        .await
        .map_err(VerifyError::KeyNotFound)?;

    // the signature covers the segments exactly as sent
    let signing_input = &token[..header_segment.len() + 1 + claims_segment.len()];

    let signature = decode_segment(signature_segment)
        .map_err(|_| VerifyError::Malformed("invalid signature segment"))?;

    if !cert.verify(signing_input.as_bytes(), &signature) {
        return Err(VerifyError::InvalidSignature);
    }

    Ok(Token {
        issuer: claims.issuer,
        audience: claims.audience,
        issued_at: claims.issued_at,
        expire_at: claims.expire_at,
        local_id: claims.local_id,
        email: claims.email,
        email_verified: claims.email_verified,
        provider_id: claims.provider_id,
        display_name: claims.display_name,
        photo_url: claims.photo_url,
        token_string: Box::from(token),
    })
}

/// Pulls the [`Token`] inserted by [`crate::layer::VerifyTokenLayer`] out of the request.
impl<S> FromRequestParts<S> for Token
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Token>()
            .cloned()
            .ok_or((StatusCode::UNAUTHORIZED, "missing id token"))
    }
}
