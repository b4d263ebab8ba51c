//! Credential sources used to authorize outbound requests.
//!
//! There's a small, closed set of ways to authenticate against the identity toolkit,
//! all of which are exposed through [`crate::transport::AuthorizedTransport`].
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use http::{HeaderName, HeaderValue, header};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use tokio::time::Instant;

/// Scope required for the identity toolkit api.
pub const IDENTITY_TOOLKIT_SCOPE: &str = "https://www.googleapis.com/auth/identitytoolkit";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_METADATA_HOST: &str = "http://metadata.google.internal";
const METADATA_TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

const METADATA_FLAVOR_NAME: HeaderName = HeaderName::from_static("metadata-flavor");
const METADATA_FLAVOR_VALUE: HeaderValue = HeaderValue::from_static("Google");

/// Lifetime requested for service account assertions.
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum Credentials {
    /// Appends `key=<api key>` to every request.
    ApiKey(Box<str>),
    /// A service account, exchanging signed assertions for access tokens.
    ServiceAccount(ServiceAccount),
    /// The platform managed credential of the compute metadata server.
    MetadataServer(MetadataServer),
}

impl Credentials {
    pub fn api_key(key: impl Into<Box<str>>) -> Self {
        Self::ApiKey(key.into())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api key",
            Self::ServiceAccount(_) => "service account",
            Self::MetadataServer(_) => "metadata server",
        }
    }

    pub(crate) async fn authorize(
        &self,
        client: &reqwest::Client,
        request: &mut reqwest::Request,
    ) -> crate::Result<()> {
        let auth_header = match self {
            Self::ApiKey(key) => {
                request.url_mut().query_pairs_mut().append_pair("key", key);
                return Ok(());
            }
            Self::ServiceAccount(account) => account.auth_header(client).await?,
            Self::MetadataServer(metadata) => metadata.auth_header(client).await?,
        };

        request.headers_mut().insert(header::AUTHORIZATION, auth_header);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    header: HeaderValue,
    refresh_at: Instant,
}

/// Single-flight cache of the current access token.
#[derive(Debug, Default)]
struct TokenCache {
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get_or_refresh<F>(&self, refresh: F) -> crate::Result<HeaderValue>
    where
        F: Future<Output = crate::Result<TokenResponse>>,
    {
        // hold the lock while refreshing, so concurrent callers wait on the one request
        let mut guard = self.cached.lock().await;

        if let Some(ref cached) = *guard {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.header.clone());
            }
        }

        let response = refresh.await?;
        let header = HeaderValue::try_from(format!("Bearer {}", response.access_token))
            .map_err(|_| crate::Error::invalid_request("access token is not a valid header"))?;

        let valid_for = Duration::from_secs(response.expires_in).saturating_sub(EXPIRY_MARGIN);

        *guard = Some(CachedToken {
            header: header.clone(),
            refresh_at: Instant::now() + valid_for,
        });

        Ok(header)
    }
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

async fn parse_token_response(response: reqwest::Response) -> crate::Result<TokenResponse> {
    if !response.status().is_success() {
        return Err(crate::error::StatusError::from_response(response).await?.into());
    }

    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub struct ServiceAccount {
    client_email: Box<str>,
    key_id: Option<Box<str>>,
    key: EncodingKey,
    token_uri: reqwest::Url,
    scope: Cow<'static, str>,
    cache: TokenCache,
}

impl fmt::Debug for ServiceAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccount")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri.as_str())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(serde::Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(serde::Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl ServiceAccount {
    /// Builds a service account from its email and PEM encoded RSA private key.
    pub fn new(client_email: impl Into<Box<str>>, pem_key: &[u8]) -> crate::Result<Self> {
        Ok(Self {
            client_email: client_email.into(),
            key_id: None,
            key: EncodingKey::from_rsa_pem(pem_key)?,
            token_uri: parse_url(DEFAULT_TOKEN_URI)?,
            scope: Cow::Borrowed(IDENTITY_TOOLKIT_SCOPE),
            cache: TokenCache::default(),
        })
    }

    /// Loads a service account from the json key file format handed out by google.
    pub fn from_json_key(bytes: &[u8]) -> crate::Result<Self> {
        let key: ServiceAccountKey = serde_json::from_slice(bytes)?;

        let mut account = Self::new(key.client_email, key.private_key.as_bytes())?;
        account.key_id = key.private_key_id.map(Box::from);

        if let Some(token_uri) = key.token_uri {
            account.token_uri = parse_url(&token_uri)?;
        }

        Ok(account)
    }

    pub fn with_token_uri(mut self, token_uri: reqwest::Url) -> Self {
        self.token_uri = token_uri;
        self
    }

    pub fn with_scope(mut self, scope: impl Into<Cow<'static, str>>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    fn sign_assertion(&self) -> crate::Result<String> {
        let iat = time::OffsetDateTime::now_utc().unix_timestamp();

        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: &self.scope,
            aud: self.token_uri.as_str(),
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.as_deref().map(str::to_owned);

        Ok(jsonwebtoken::encode(&header, &claims, &self.key)?)
    }

    async fn auth_header(&self, client: &reqwest::Client) -> crate::Result<HeaderValue> {
        self.cache
            .get_or_refresh(async {
                let assertion = self.sign_assertion()?;

                let response = client
                    .post(self.token_uri.clone())
                    .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                    .send()
                    .await?;

                parse_token_response(response).await
            })
            .await
    }
}

#[derive(Debug)]
pub struct MetadataServer {
    token_url: reqwest::Url,
    scope: Cow<'static, str>,
    cache: TokenCache,
}

impl MetadataServer {
    pub fn new() -> crate::Result<Self> {
        Self::with_host(DEFAULT_METADATA_HOST)
    }

    /// Points at a different metadata host, i.e an emulator.
    pub fn with_host(host: &str) -> crate::Result<Self> {
        let token_url = parse_url(&format!("{}{METADATA_TOKEN_PATH}", host.trim_end_matches('/')))?;

        Ok(Self {
            token_url,
            scope: Cow::Borrowed(IDENTITY_TOOLKIT_SCOPE),
            cache: TokenCache::default(),
        })
    }

    async fn auth_header(&self, client: &reqwest::Client) -> crate::Result<HeaderValue> {
        self.cache
            .get_or_refresh(async {
                let response = client
                    .get(self.token_url.clone())
                    .query(&[("scopes", &*self.scope)])
                    .header(METADATA_FLAVOR_NAME, METADATA_FLAVOR_VALUE)
                    .send()
                    .await?;

                parse_token_response(response).await
            })
            .await
    }
}

fn parse_url(url: &str) -> crate::Result<reqwest::Url> {
    reqwest::Url::parse(url).map_err(|err| crate::Error::config(format!("invalid url {url}: {err}")))
}
