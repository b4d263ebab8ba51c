//! High level client, tying together configuration, token verification and the account api.
use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, header};

mod list_users;
pub use list_users::ListUsersStream;

mod oob;
pub use oob::{
    OOB_ACTION_PARAM, OOB_CAPTCHA_CHALLENGE_PARAM, OOB_CAPTCHA_RESPONSE_PARAM, OOB_CODE_PARAM,
    OOB_EMAIL_PARAM, OOB_NEW_EMAIL_PARAM, OobAction, OobCodeResponse,
};

use crate::api::{
    ApiClient, DeleteAccountRequest, DownloadAccountRequest, GetAccountInfoRequest,
    SetAccountInfoRequest, UploadAccountRequest, User,
};
use crate::certs::Certificates;
use crate::config::Config;
use crate::credentials::{Credentials, ServiceAccount};
use crate::layer::VerifyTokenLayer;
use crate::token::{Token, verify_token};
use crate::transport::{AuthorizedTransport, Transport};

/// Page size used by [`Client::list_users`].
pub const MAX_RESULTS_PER_PAGE: usize = 50;

/// Cheap to clone, all clones share the same certificate cache.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Config,
    api: ApiClient,
    certs: Certificates,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.config.client_id)
            .field("api", &self.inner.api)
            .field("certs", &self.inner.certs)
            .finish()
    }
}

impl Client {
    /// Builds a client, downloading the public certificates up front.
    ///
    /// Without a transport, requests are authorized with the config's service account.
    pub async fn new(config: &Config, transport: Option<Arc<dyn Transport>>) -> crate::Result<Self> {
        let (config, transport) = prepare(config, transport).await?;
        let certs = Certificates::load(config.public_certs_url()?, Arc::clone(&transport)).await?;
        let api = build_api_client(&config, transport)?;

        Self::from_parts(config, api, certs)
    }

    /// Like [`Client::new`], but defers downloading certificates until the first
    /// token is verified.
    pub async fn new_lazy(config: &Config, transport: Option<Arc<dyn Transport>>) -> crate::Result<Self> {
        let (config, transport) = prepare(config, transport).await?;
        let certs = Certificates::lazy(config.public_certs_url()?, Arc::clone(&transport));
        let api = build_api_client(&config, transport)?;

        Self::from_parts(config, api, certs)
    }

    /// Assembles a client from already built pieces. The config must be normalized.
    pub fn from_parts(config: Config, api: ApiClient, certs: Certificates) -> crate::Result<Self> {
        if config.widget_url.is_empty() {
            return Err(crate::Error::config("missing widgetUrl"));
        }

        oob::check_widget_url(&config.widget_url)?;

        Ok(Self {
            inner: Arc::new(ClientInner { config, api, certs }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn certificates(&self) -> &Certificates {
        &self.inner.certs
    }

    /// A layer that verifies the ID token of every request.
    pub fn layer(&self) -> VerifyTokenLayer {
        VerifyTokenLayer::new(self.clone())
    }

    /// Pulls the ID token out of the request's cookies, if present.
    pub fn token_from_request<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        find_cookie(headers, &self.inner.config.cookie_name)
    }

    /// Verifies a token issued for this client's id. The issuer isn't checked.
    pub async fn validate_token(&self, token: &str) -> crate::Result<Token> {
        let audiences = [&*self.inner.config.client_id];
        let token = verify_token(token, &audiences, &[], &self.inner.certs).await?;
        Ok(token)
    }

    /// Validates the token, then fetches the full account of its user.
    pub async fn user_by_token(&self, token: &str) -> crate::Result<User> {
        let token = self.validate_token(token).await?;
        let mut user = self.user_by_local_id(token.local_id()).await?;

        // the account doesn't know how the user signed in this time
        user.provider_id = token.provider_id().map(Box::from);
        Ok(user)
    }

    pub async fn user_by_email(&self, email: &str) -> crate::Result<User> {
        let request = GetAccountInfoRequest {
            emails: &[email],
            ..Default::default()
        };

        first_user(self.inner.api.get_account_info(&request).await?, email)
    }

    pub async fn user_by_local_id(&self, local_id: &str) -> crate::Result<User> {
        let request = GetAccountInfoRequest {
            local_ids: &[local_id],
            ..Default::default()
        };

        first_user(self.inner.api.get_account_info(&request).await?, local_id)
    }

    /// Updates the email, display name, password and verified flag of a user.
    pub async fn update_user(&self, user: &User) -> crate::Result<()> {
        self.inner
            .api
            .set_account_info(&SetAccountInfoRequest::from_user(user))
            .await
    }

    pub async fn delete_user(&self, user: &User) -> crate::Result<()> {
        self.inner
            .api
            .delete_account(&DeleteAccountRequest {
                local_id: &user.local_id,
            })
            .await
    }

    /// Uploads users along with their password hashes, made with `algorithm` and `key`.
    pub async fn upload_users(
        &self,
        users: &[User],
        algorithm: &str,
        key: &[u8],
        salt_separator: &[u8],
    ) -> crate::Result<()> {
        self.inner
            .api
            .upload_account(&UploadAccountRequest {
                users,
                hash_algorithm: algorithm,
                signer_key: key,
                salt_separator,
            })
            .await
    }

    /// Fetches a single page of up to `n` users, returning them along with the token of
    /// the next page, if there is one.
    pub async fn list_users_n(
        &self,
        n: usize,
        page_token: Option<&str>,
    ) -> crate::Result<(Vec<User>, Option<Box<str>>)> {
        let response = self
            .inner
            .api
            .download_account(&DownloadAccountRequest {
                max_results: n,
                next_page_token: page_token.filter(|token| !token.is_empty()),
            })
            .await?;

        let next_page_token = response.next_page_token.filter(|token| !token.is_empty());
        Ok((response.users, next_page_token))
    }

    /// Streams every user, a page at a time.
    pub fn list_users(&self) -> ListUsersStream {
        ListUsersStream::new(self.clone(), MAX_RESULTS_PER_PAGE)
    }
}

async fn prepare(
    config: &Config,
    transport: Option<Arc<dyn Transport>>,
) -> crate::Result<(Config, Arc<dyn Transport>)> {
    let mut config = config.clone();
    config.normalize(transport.is_none()).await?;

    let transport = match transport {
        Some(transport) => transport,
        None => service_account_transport(&config)?,
    };

    Ok((config, transport))
}

fn service_account_transport(config: &Config) -> crate::Result<Arc<dyn Transport>> {
    let (Some(email), Some(pem_key)) = (config.service_account.as_deref(), config.pem_key.as_deref())
    else {
        return Err(crate::Error::config("missing service account info"));
    };

    let account = ServiceAccount::new(email, pem_key)?;
    Ok(AuthorizedTransport::new(Credentials::ServiceAccount(account))?.into_shared())
}

fn build_api_client(config: &Config, transport: Arc<dyn Transport>) -> crate::Result<ApiClient> {
    match config.api_base_url()? {
        Some(base_url) => ApiClient::with_base_url(base_url, transport),
        None => ApiClient::new(transport),
    }
}

fn first_user(users: Vec<User>, key: &str) -> crate::Result<User> {
    users
        .into_iter()
        .next()
        .ok_or_else(|| crate::Error::UserNotFound(Box::from(key)))
}

/// Finds a cookie by name across every `Cookie` header.
pub(crate) fn find_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find_map(|(key, value)| (key == name).then(|| value.trim_matches('"')))
}

/// The body to answer a successful widget callback with.
pub fn success_response() -> String {
    serde_json::json!({ "success": true }).to_string()
}

/// The body to answer a failed widget callback with.
pub fn error_response(error: &dyn fmt::Display) -> String {
    serde_json::json!({ "error": error.to_string() }).to_string()
}
