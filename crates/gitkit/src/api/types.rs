//! Request and response payloads of the relyingparty api.
use std::borrow::Cow;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::segment::decode_segment;

#[inline]
fn is_false(b: &bool) -> bool {
    !*b
}

#[inline]
fn is_empty_slice<T>(slice: &&[T]) -> bool {
    slice.is_empty()
}

#[inline]
fn is_zero(n: &usize) -> bool {
    *n == 0
}

fn serialize_base64<S, B>(bytes: &B, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    B: AsRef<[u8]>,
{
    serializer.serialize_str(&URL_SAFE.encode(bytes.as_ref()))
}

/// Binary data, sent as padded base64url rather than standard base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Base64Bytes(pub Vec<u8>);

impl From<Vec<u8>> for Base64Bytes {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Base64Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_base64(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Cow::<'de, str>::deserialize(deserializer)?;
        decode_segment(&encoded)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Unix time in milliseconds. The api sends these as floats.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimestampMillis(pub f64);

impl TimestampMillis {
    pub fn as_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos((self.0 * 1e6) as i128).ok()
    }
}

/// User information from one of the identity providers linked to an account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUserInfo {
    /// Usually the provider's domain, i.e `google.com`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federated_id: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<Box<str>>,
}

/// A user account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "str::is_empty")]
    pub local_id: Box<str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<Box<str>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_user_info: Vec<ProviderUserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<Base64Bytes>,
    #[serde(
        default,
        rename = "passwordUpdateAt",
        skip_serializing_if = "Option::is_none"
    )]
    pub password_updated_at: Option<TimestampMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<Base64Bytes>,
    /// The provider the user signed in with, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<Box<str>>,
    /// A new raw password. Only used when updating a user, never sent as part of the account.
    #[serde(skip)]
    pub password: Option<Box<str>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdpConfig {
    #[serde(default)]
    pub provider: Box<str>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Box<str>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub project_id: Box<str>,
    #[serde(default)]
    pub api_key: Box<str>,
    #[serde(default)]
    pub allow_password_user: bool,
    #[serde(default, rename = "idpConfig")]
    pub idp_configs: Vec<IdpConfig>,
}

/// Looks up accounts by email or local id. At least one of either is required.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GetAccountInfoRequest<'a> {
    #[serde(rename = "email", skip_serializing_if = "is_empty_slice")]
    pub emails: &'a [&'a str],
    #[serde(rename = "localId", skip_serializing_if = "is_empty_slice")]
    pub local_ids: &'a [&'a str],
}

impl GetAccountInfoRequest<'_> {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.emails.is_empty() && self.local_ids.is_empty() {
            return Err(crate::Error::invalid_request(
                "getAccountInfo: must provide an email or a local id",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct GetAccountInfoResponse {
    #[serde(default)]
    pub(crate) users: Vec<User>,
}

/// Updates an account, found by either its local id or email.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAccountInfoRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<&'a str>,
    #[serde(skip_serializing_if = "is_false")]
    pub email_verified: bool,
}

impl<'a> SetAccountInfoRequest<'a> {
    /// Copies the updatable fields of a user.
    pub fn from_user(user: &'a User) -> Self {
        Self {
            local_id: non_empty(Some(&*user.local_id)),
            email: non_empty(user.email.as_deref()),
            display_name: user.display_name.as_deref(),
            password: user.password.as_deref(),
            email_verified: user.email_verified,
        }
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if non_empty(self.local_id).is_none() && non_empty(self.email).is_none() {
            return Err(crate::Error::invalid_request(
                "setAccountInfo: must provide an email or a local id",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAccountRequest<'a> {
    pub local_id: &'a str,
}

impl DeleteAccountRequest<'_> {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.local_id.is_empty() {
            return Err(crate::Error::invalid_request(
                "deleteAccount: must provide a local id",
            ));
        }

        Ok(())
    }
}

/// Uploads accounts along with their password hashes. The hash algorithm and
/// signer key are required.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAccountRequest<'a> {
    #[serde(skip_serializing_if = "is_empty_slice")]
    pub users: &'a [User],
    #[serde(skip_serializing_if = "str::is_empty")]
    pub hash_algorithm: &'a str,
    #[serde(
        serialize_with = "serialize_base64",
        skip_serializing_if = "is_empty_slice"
    )]
    pub signer_key: &'a [u8],
    #[serde(
        serialize_with = "serialize_base64",
        skip_serializing_if = "is_empty_slice"
    )]
    pub salt_separator: &'a [u8],
}

impl UploadAccountRequest<'_> {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.users.is_empty() {
            return Err(crate::Error::invalid_request(
                "uploadAccount: must provide at least one account",
            ));
        }

        if self.hash_algorithm.is_empty() {
            return Err(crate::Error::invalid_request(
                "uploadAccount: must provide the hash algorithm",
            ));
        }

        if self.signer_key.is_empty() {
            return Err(crate::Error::invalid_request(
                "uploadAccount: must provide the signer key",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadFailure {
    /// Index of the failed account in the uploaded list.
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub message: Box<str>,
}

/// Some of the uploaded accounts were rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadError {
    failures: Vec<UploadFailure>,
}

impl UploadError {
    pub fn failures(&self) -> &[UploadFailure] {
        &self.failures
    }
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to upload {} account(s): ", self.failures.len())?;

        for failure in &self.failures {
            write!(f, "{{{}: {}}}", failure.index, failure.message)?;
        }

        Ok(())
    }
}

impl std::error::Error for UploadError {}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct UploadAccountResponse {
    #[serde(default, rename = "error")]
    failures: Vec<UploadFailure>,
}

impl UploadAccountResponse {
    pub(crate) fn into_result(self) -> Result<(), UploadError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(UploadError {
                failures: self.failures,
            })
        }
    }
}

/// One page of an account download. `next_page_token` is `None` on the first page.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAccountRequest<'a> {
    #[serde(skip_serializing_if = "is_zero")]
    pub max_results: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<&'a str>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadAccountResponse {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub next_page_token: Option<Box<str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OobRequestType {
    /// Needs an email and a captcha response.
    PasswordReset,
    /// Needs the old email, the new email and the user's ID token.
    NewEmailAccept,
    /// Needs an email.
    VerifyEmail,
}

/// Requests an out-of-band confirmation code.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOobCodeRequest<'a> {
    pub request_type: OobRequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<&'a str>,
    #[serde(rename = "challenge", skip_serializing_if = "Option::is_none")]
    pub captcha_challenge: Option<&'a str>,
    #[serde(rename = "captchaResp", skip_serializing_if = "Option::is_none")]
    pub captcha_response: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_email: Option<&'a str>,
    #[serde(rename = "idToken", skip_serializing_if = "Option::is_none")]
    pub id_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ip: Option<&'a str>,
}

impl<'a> GetOobCodeRequest<'a> {
    pub fn new(request_type: OobRequestType) -> Self {
        Self {
            request_type,
            email: None,
            captcha_challenge: None,
            captcha_response: None,
            new_email: None,
            id_token: None,
            user_ip: None,
        }
    }

    pub fn email(mut self, email: &'a str) -> Self {
        self.email = Some(email);
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        let missing = |value: Option<&str>, what: &'static str| match non_empty(value) {
            Some(_) => Ok(()),
            None => Err(crate::Error::invalid_request(what)),
        };

        match self.request_type {
            OobRequestType::PasswordReset => {
                missing(self.email, "getOobConfirmationCode: must provide an email")?;
                missing(
                    self.captcha_response,
                    "getOobConfirmationCode: must provide a captcha response",
                )
            }
            OobRequestType::NewEmailAccept => {
                missing(self.email, "getOobConfirmationCode: must provide the old email")?;
                missing(self.new_email, "getOobConfirmationCode: must provide the new email")?;
                missing(self.id_token, "getOobConfirmationCode: must provide the id token")
            }
            OobRequestType::VerifyEmail => {
                missing(self.email, "getOobConfirmationCode: must provide an email")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOobCodeResponse {
    #[serde(default)]
    pub oob_code: Box<str>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}
