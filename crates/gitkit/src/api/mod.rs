//! Client for the identity toolkit relyingparty api.
use std::fmt;
use std::sync::Arc;

use http::{HeaderValue, header};
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};

mod types;
pub use types::{
    Base64Bytes, DeleteAccountRequest, DownloadAccountRequest, DownloadAccountResponse,
    GetAccountInfoRequest, GetOobCodeRequest, GetOobCodeResponse, IdpConfig, OobRequestType,
    ProjectConfig, ProviderUserInfo, SetAccountInfoRequest, TimestampMillis, UploadAccountRequest,
    UploadError, UploadFailure, User,
};

use crate::error::StatusError;
use crate::transport::Transport;

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/identitytoolkit/v3/relyingparty";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiMethod {
    GetAccountInfo,
    SetAccountInfo,
    DeleteAccount,
    UploadAccount,
    DownloadAccount,
    GetOobCode,
    GetProjectConfig,
}

impl ApiMethod {
    const fn as_str(self) -> &'static str {
        match self {
            Self::GetAccountInfo => "getAccountInfo",
            Self::SetAccountInfo => "setAccountInfo",
            Self::DeleteAccount => "deleteAccount",
            Self::UploadAccount => "uploadAccount",
            Self::DownloadAccount => "downloadAccount",
            Self::GetOobCode => "getOobConfirmationCode",
            Self::GetProjectConfig => "getProjectConfig",
        }
    }
}

/// Sends requests to the relyingparty api. Authentication is entirely up to the
/// [`Transport`], since different methods need different credentials.
#[derive(Clone)]
pub struct ApiClient {
    base_url: Arc<reqwest::Url>,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("transport", &self.transport)
            .finish()
    }
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>) -> crate::Result<Self> {
        let base_url = reqwest::Url::parse(DEFAULT_API_BASE_URL)
            .map_err(|err| crate::Error::config(format!("invalid api base url: {err}")))?;

        Self::with_base_url(base_url, transport)
    }

    /// Points the client at a different api root, i.e an emulator.
    pub fn with_base_url(base_url: reqwest::Url, transport: Arc<dyn Transport>) -> crate::Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(crate::Error::config(format!(
                "api base url {base_url} can't be used as a base"
            )));
        }

        Ok(Self {
            base_url: Arc::new(base_url),
            transport,
        })
    }

    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    fn method_url(&self, method: ApiMethod) -> reqwest::Url {
        let mut url = (*self.base_url).clone();

        // checked in the constructor
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(method.as_str());
        }

        url
    }

    async fn request<B, T>(
        &self,
        method: reqwest::Method,
        api_method: ApiMethod,
        body: Option<&B>,
    ) -> crate::Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = reqwest::Request::new(method, self.method_url(api_method));

        if let Some(body) = body {
            let bytes = serde_json::to_vec(body)?;
            request
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            *request.body_mut() = Some(bytes.into());
        }

        let response = self.transport.execute(request).await?;
        parse_json_response(response).await
    }

    async fn post<B, T>(&self, api_method: ApiMethod, body: &B) -> crate::Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.request(reqwest::Method::POST, api_method, Some(body)).await
    }

    /// Looks up accounts by email or local id. Unknown accounts are simply missing from
    /// the result.
    pub async fn get_account_info(&self, request: &GetAccountInfoRequest<'_>) -> crate::Result<Vec<User>> {
        request.validate()?;

        let response: types::GetAccountInfoResponse =
            self.post(ApiMethod::GetAccountInfo, request).await?;

        Ok(response.users)
    }

    pub async fn set_account_info(&self, request: &SetAccountInfoRequest<'_>) -> crate::Result<()> {
        request.validate()?;

        let _: IgnoredAny = self.post(ApiMethod::SetAccountInfo, request).await?;
        Ok(())
    }

    pub async fn delete_account(&self, request: &DeleteAccountRequest<'_>) -> crate::Result<()> {
        request.validate()?;

        let _: IgnoredAny = self.post(ApiMethod::DeleteAccount, request).await?;
        Ok(())
    }

    /// Uploads accounts. If only some of them are rejected, that's reported as an
    /// [`UploadError`] listing each failure.
    pub async fn upload_account(&self, request: &UploadAccountRequest<'_>) -> crate::Result<()> {
        request.validate()?;

        let response: types::UploadAccountResponse =
            self.post(ApiMethod::UploadAccount, request).await?;

        response.into_result().map_err(crate::Error::Upload)
    }

    pub async fn download_account(
        &self,
        request: &DownloadAccountRequest<'_>,
    ) -> crate::Result<DownloadAccountResponse> {
        self.post(ApiMethod::DownloadAccount, request).await
    }

    pub async fn get_oob_code(&self, request: &GetOobCodeRequest<'_>) -> crate::Result<GetOobCodeResponse> {
        request.validate()?;
        self.post(ApiMethod::GetOobCode, request).await
    }

    pub async fn get_project_config(&self) -> crate::Result<ProjectConfig> {
        self.request::<(), _>(reqwest::Method::GET, ApiMethod::GetProjectConfig, None)
            .await
    }
}

async fn parse_json_response<T>(response: reqwest::Response) -> crate::Result<T>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let url = response.url().clone();
    let bytes = response.bytes().await?;

    // handle the successful case first
    if status.is_success() {
        return Ok(serde_json::from_slice(&bytes)?);
    }

    Err(crate::Error::Status(StatusError::new_from(url, status, bytes)))
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn client(server: &MockServer) -> ApiClient {
        let base_url = reqwest::Url::parse(&format!("{}/identitytoolkit/v3/relyingparty/", server.uri())).unwrap();
        ApiClient::with_base_url(base_url, Arc::new(reqwest::Client::new())).unwrap()
    }

    #[test]
    fn test_method_url() {
        let client = ApiClient::new(Arc::new(reqwest::Client::new())).unwrap();
        assert_eq!(
            client.method_url(ApiMethod::GetOobCode).as_str(),
            "https://www.googleapis.com/identitytoolkit/v3/relyingparty/getOobConfirmationCode"
        );

        let not_a_base = reqwest::Url::parse("mailto:someone@example.com").unwrap();
        assert!(ApiClient::with_base_url(not_a_base, Arc::new(reqwest::Client::new())).is_err());
    }

    #[tokio::test]
    async fn test_get_account_info() -> crate::Result<()> {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/identitytoolkit/v3/relyingparty/getAccountInfo"))
            .and(header_eq("content-type", "application/json"))
            .and(body_json(serde_json::json!({ "localId": ["1234"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "identitytoolkit#GetAccountInfoResponse",
                "users": [{ "localId": "1234", "email": "user@example.com", "emailVerified": true }],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let users = client(&server)
            .await
            .get_account_info(&GetAccountInfoRequest {
                local_ids: &["1234"],
                ..Default::default()
            })
            .await?;

        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email.as_deref(), Some("user@example.com"));
        Ok(())
    }

    #[tokio::test]
    async fn test_validation_skips_network() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let client = client(&server).await;

        let error = client
            .get_account_info(&GetAccountInfoRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(error, crate::Error::InvalidRequest(_)));

        let error = client
            .delete_account(&DeleteAccountRequest { local_id: "" })
            .await
            .unwrap_err();
        assert!(matches!(error, crate::Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_upload_partial_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/identitytoolkit/v3/relyingparty/uploadAccount"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": [{ "index": 1, "message": "email exists" }],
            })))
            .mount(&server)
            .await;

        let users = [User::default(), User::default()];
        let error = client(&server)
            .await
            .upload_account(&UploadAccountRequest {
                users: &users,
                hash_algorithm: "HMAC_SHA256",
                signer_key: b"signer",
                salt_separator: &[],
            })
            .await
            .unwrap_err();

        match error {
            crate::Error::Upload(upload) => {
                assert_eq!(upload.failures()[0].index, 1);
                assert_eq!(&*upload.failures()[0].message, "email exists");
            }
            other => panic!("expected an upload error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/identitytoolkit/v3/relyingparty/getOobConfirmationCode"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 400, "message": "EMAIL_NOT_FOUND" },
            })))
            .mount(&server)
            .await;

        let request = GetOobCodeRequest::new(OobRequestType::VerifyEmail).email("nobody@example.com");
        let error = client(&server).await.get_oob_code(&request).await.unwrap_err();

        match error {
            crate::Error::Status(status) => {
                assert_eq!(status.status(), http::StatusCode::BAD_REQUEST);
                assert_eq!(status.message(), Some("EMAIL_NOT_FOUND"));
            }
            other => panic!("expected a status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_project_config() -> crate::Result<()> {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/identitytoolkit/v3/relyingparty/getProjectConfig"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "projectId": "my-project",
                "apiKey": "browser-key",
                "allowPasswordUser": true,
                "idpConfig": [{ "provider": "GOOGLE", "enabled": true, "clientId": "123.apps" }],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = client(&server).await.get_project_config().await?;
        assert_eq!(&*config.project_id, "my-project");
        assert!(config.allow_password_user);
        assert_eq!(config.idp_configs[0].client_id.as_deref(), Some("123.apps"));
        Ok(())
    }
}
