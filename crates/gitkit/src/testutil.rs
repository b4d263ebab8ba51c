//! Shared fixtures and fakes for unit tests.
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::future::BoxFuture;
use http::{StatusCode, header};
use jsonwebtoken::{Algorithm, EncodingKey};
use parking_lot::Mutex;

use crate::transport::Transport;

pub const CERT_A: &str = include_str!("../tests/fixtures/cert_a.pem");
pub const CERT_B: &str = include_str!("../tests/fixtures/cert_b.pem");
pub const KEY_A: &str = include_str!("../tests/fixtures/key_a.pem");
pub const KEY_B: &str = include_str!("../tests/fixtures/key_b.pem");

pub const CLIENT_ID: &str = "924226504183.apps.googleusercontent.com";
pub const ISSUER: &str = "https://identitytoolkit.google.com/";

/// Builds a certificate endpoint body, a json map of key id to PEM.
pub fn certs_body(certs: &[(&str, &str)]) -> Vec<u8> {
    let map = certs
        .iter()
        .map(|(kid, pem)| (kid.to_string(), serde_json::Value::from(*pem)))
        .collect::<serde_json::Map<_, _>>();

    serde_json::to_vec(&map).unwrap()
}

/// RS256 signature of `message`, as an unpadded base64url segment.
pub fn sign_raw(message: &[u8], private_key: &str) -> String {
    let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).unwrap();
    jsonwebtoken::crypto::sign(message, &key, Algorithm::RS256).unwrap()
}

pub fn encode_segment(value: &serde_json::Value) -> String {
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
}

/// Builds a compact token from arbitrary header and claims, signed with `private_key`.
pub fn build_token(header: &serde_json::Value, claims: &serde_json::Value, private_key: &str) -> String {
    let signing_input = format!("{}.{}", encode_segment(header), encode_segment(claims));
    let signature = sign_raw(signing_input.as_bytes(), private_key);
    format!("{signing_input}.{signature}")
}

pub fn sign_token(claims: &serde_json::Value, kid: &str, private_key: &str) -> String {
    let header = serde_json::json!({ "alg": "RS256", "kid": kid, "typ": "JWT" });
    build_token(&header, claims, private_key)
}

/// Claims that pass validation against [`CLIENT_ID`] and [`ISSUER`] for the next hour.
pub fn valid_claims() -> serde_json::Value {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();

    serde_json::json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "iat": now - 60,
        "exp": now + 3600,
        "user_id": "1234567890",
        "email": "user@example.com",
        "verified": true,
        "provider_id": "google.com",
        "display_name": "Test User",
        "photo_url": "https://example.com/photo.png",
    })
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    body: Vec<u8>,
    cache_control: Option<&'static str>,
    delay: Duration,
}

impl MockResponse {
    pub fn ok(body: Vec<u8>, cache_control: Option<&'static str>) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            cache_control,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            body: br#"{"error":{"message":"backend error"}}"#.to_vec(),
            cache_control: None,
            delay: Duration::ZERO,
        }
    }

    /// Answers only after `delay` has passed.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn to_response(&self) -> reqwest::Response {
        let mut builder = http::Response::builder().status(self.status);

        if let Some(cache_control) = self.cache_control {
            builder = builder.header(header::CACHE_CONTROL, cache_control);
        }

        reqwest::Response::from(builder.body(self.body.clone()).unwrap())
    }
}

/// Replays canned responses in order, repeating the last one forever.
#[derive(Debug)]
pub struct MockTransport {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: AtomicUsize,
}

impl MockTransport {
    pub fn new(responses: impl IntoIterator<Item = MockResponse>) -> Arc<Self> {
        let responses = responses.into_iter().collect::<VecDeque<_>>();
        assert!(!responses.is_empty(), "need at least one response");

        Arc::new(Self {
            responses: Mutex::new(responses),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn execute(&self, _request: reqwest::Request) -> BoxFuture<'static, crate::Result<reqwest::Response>> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let response = {
            let mut responses = self.responses.lock();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses[0].clone()
            }
        };

        let delay = response.delay;
        let response = response.to_response();

        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(response)
        })
    }
}
