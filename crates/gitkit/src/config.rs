use std::path::{Path, PathBuf};

pub const DEFAULT_WIDGET_MODE_PARAM_NAME: &str = "mode";
pub const DEFAULT_COOKIE_NAME: &str = "gtoken";
pub const DEFAULT_PUBLIC_CERTS_URL: &str =
    "https://www.googleapis.com/identitytoolkit/v3/relyingparty/publicKeys";

/// Client configuration, in the same json layout as the identity toolkit's config files.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// The OAuth2 client id of the server. Tokens must be issued for this audience.
    #[serde(default)]
    pub client_id: Box<str>,
    /// Url of the sign in widget. May be absolute, or a path relative to the request.
    #[serde(default)]
    pub widget_url: Box<str>,
    #[serde(default)]
    pub widget_mode_param_name: Box<str>,
    /// Cookie holding the ID token.
    #[serde(default)]
    pub cookie_name: Box<str>,
    /// Api key used to fetch the public certificates.
    #[serde(default)]
    pub server_api_key: Box<str>,
    #[serde(default, rename = "serviceAccountEmail")]
    pub service_account: Option<Box<str>>,
    #[serde(default, rename = "serviceAccountPrivateKeyFile")]
    pub pem_key_path: Option<PathBuf>,
    /// The service account's PEM private key. Loaded from `pem_key_path` if not set.
    #[serde(skip)]
    pub pem_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_certs_url: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<Box<str>>,
}

impl Config {
    /// Reads a json config file.
    pub async fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Fills in defaults and checks for required fields, loading the service account
    /// key from disk if only its path was given.
    pub async fn normalize(&mut self, require_service_account: bool) -> crate::Result<()> {
        if self.client_id.is_empty() {
            return Err(crate::Error::config("missing clientId"));
        }

        if self.widget_mode_param_name.is_empty() {
            self.widget_mode_param_name = Box::from(DEFAULT_WIDGET_MODE_PARAM_NAME);
        }

        if self.cookie_name.is_empty() {
            self.cookie_name = Box::from(DEFAULT_COOKIE_NAME);
        }

        if self.server_api_key.is_empty() {
            return Err(crate::Error::config("missing serverApiKey"));
        }

        if self.pem_key.as_ref().is_none_or(Vec::is_empty) {
            if let Some(ref path) = self.pem_key_path {
                self.pem_key = Some(tokio::fs::read(path).await?);
            }
        }

        if require_service_account {
            if self.service_account.as_deref().is_none_or(str::is_empty) {
                return Err(crate::Error::config("missing serviceAccountEmail"));
            }

            if self.pem_key.as_ref().is_none_or(Vec::is_empty) {
                return Err(crate::Error::config(
                    "missing service account private key (or serviceAccountPrivateKeyFile)",
                ));
            }
        }

        Ok(())
    }

    /// The certificate endpoint, with the server api key attached.
    pub fn public_certs_url(&self) -> crate::Result<reqwest::Url> {
        let base = self.public_certs_url.as_deref().unwrap_or(DEFAULT_PUBLIC_CERTS_URL);

        let mut url = reqwest::Url::parse(base)
            .map_err(|err| crate::Error::config(format!("invalid publicCertsUrl {base}: {err}")))?;

        url.query_pairs_mut().append_pair("key", &self.server_api_key);
        Ok(url)
    }

    pub fn api_base_url(&self) -> crate::Result<Option<reqwest::Url>> {
        self.api_base_url
            .as_deref()
            .map(|url| {
                reqwest::Url::parse(url)
                    .map_err(|err| crate::Error::config(format!("invalid apiBaseUrl {url}: {err}")))
            })
            .transpose()
    }
}
