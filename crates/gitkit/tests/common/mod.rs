#![allow(dead_code)]
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CERT_A: &str = include_str!("../fixtures/cert_a.pem");
pub const CERT_B: &str = include_str!("../fixtures/cert_b.pem");
pub const KEY_A: &str = include_str!("../fixtures/key_a.pem");
pub const KEY_B: &str = include_str!("../fixtures/key_b.pem");

pub const CLIENT_ID: &str = "924226504183.apps.googleusercontent.com";
pub const ISSUER: &str = "https://identitytoolkit.google.com/";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn certs_json(certs: &[(&str, &str)]) -> serde_json::Value {
    certs
        .iter()
        .map(|(kid, pem)| (kid.to_string(), serde_json::Value::from(*pem)))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

/// Serves `certs` from `/publicKeys`, cacheable for `max_age` seconds.
pub async fn mount_certs(server: &MockServer, certs: &[(&str, &str)], max_age: u64) {
    Mock::given(method("GET"))
        .and(path("/publicKeys"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", format!("public, max-age={max_age}").as_str())
                .set_body_json(certs_json(certs)),
        )
        .mount(server)
        .await;
}

pub fn certs_url(server: &MockServer) -> reqwest::Url {
    reqwest::Url::parse(&format!("{}/publicKeys", server.uri())).unwrap()
}

pub fn claims(expires_in: i64) -> serde_json::Value {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();

    serde_json::json!({
        "iss": ISSUER,
        "aud": CLIENT_ID,
        "iat": now - 60,
        "exp": now + expires_in,
        "user_id": "1234567890",
        "email": "user@example.com",
        "verified": true,
        "provider_id": "google.com",
    })
}

pub fn sign(claims: &serde_json::Value, kid: &str, private_key: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_owned());

    let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}
