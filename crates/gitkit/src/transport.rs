//! Outbound HTTP plumbing shared by the certificate cache and the account api.
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::credentials::Credentials;

pub(crate) const USER_AGENT: &str = concat!("gitkit-rs/", env!("CARGO_PKG_VERSION"));

/// Executes outbound requests, attaching whatever authentication the provider needs.
///
/// Both the certificate cache and the account api only ever see an `Arc<dyn Transport>`,
/// so any credential source (or a test double) can sit behind it.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    fn execute(&self, request: reqwest::Request) -> BoxFuture<'static, crate::Result<reqwest::Response>>;
}

impl Transport for reqwest::Client {
    fn execute(&self, request: reqwest::Request) -> BoxFuture<'static, crate::Result<reqwest::Response>> {
        let fut = reqwest::Client::execute(self, request);
        Box::pin(async move { fut.await.map_err(crate::Error::Reqwest) })
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    #[inline]
    fn execute(&self, request: reqwest::Request) -> BoxFuture<'static, crate::Result<reqwest::Response>> {
        T::execute(self, request)
    }
}

/// Builds the default client, with our user agent.
pub fn default_client() -> crate::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(crate::Error::Reqwest)
}

/// A [`Transport`] that authorizes every request with a set of [`Credentials`].
#[derive(Clone)]
pub struct AuthorizedTransport {
    client: reqwest::Client,
    credentials: Arc<Credentials>,
}

impl fmt::Debug for AuthorizedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedTransport")
            .field("credentials", &self.credentials.name())
            .finish_non_exhaustive()
    }
}

impl AuthorizedTransport {
    pub fn new(credentials: Credentials) -> crate::Result<Self> {
        Ok(Self::from_parts(default_client()?, credentials))
    }

    pub fn from_parts(client: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            client,
            credentials: Arc::new(credentials),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn into_shared(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }
}

impl Transport for AuthorizedTransport {
    fn execute(&self, mut request: reqwest::Request) -> BoxFuture<'static, crate::Result<reqwest::Response>> {
        let client = self.client.clone();
        let credentials = Arc::clone(&self.credentials);

        Box::pin(async move {
            credentials.authorize(&client, &mut request).await?;
            client.execute(request).await.map_err(crate::Error::Reqwest)
        })
    }
}
