use std::borrow::Cow;

use http::request::Parts;
use reqwest::Url;

use super::Client;
use crate::api::{GetOobCodeRequest, OobRequestType};

pub const OOB_ACTION_PARAM: &str = "action";
pub const OOB_EMAIL_PARAM: &str = "email";
pub const OOB_CAPTCHA_CHALLENGE_PARAM: &str = "challenge";
pub const OOB_CAPTCHA_RESPONSE_PARAM: &str = "response";
pub const OOB_NEW_EMAIL_PARAM: &str = "newEmail";
pub const OOB_CODE_PARAM: &str = "oobCode";

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The widget actions that need an out-of-band code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OobAction {
    ResetPassword,
    ChangeEmail,
}

impl OobAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResetPassword => "resetPassword",
            Self::ChangeEmail => "changeEmail",
        }
    }

    pub fn from_param(param: &str) -> Option<Self> {
        match param {
            "resetPassword" => Some(Self::ResetPassword),
            "changeEmail" => Some(Self::ChangeEmail),
            _ => None,
        }
    }

    const fn request_type(self) -> OobRequestType {
        match self {
            Self::ResetPassword => OobRequestType::PasswordReset,
            Self::ChangeEmail => OobRequestType::NewEmailAccept,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OobCodeResponse {
    pub action: OobAction,
    pub email: Box<str>,
    /// Only set when changing email.
    pub new_email: Option<Box<str>>,
    pub oob_code: Box<str>,
    /// Link to the widget carrying the code, to send to the user.
    pub oob_code_url: Url,
}

/// Checks that a (possibly relative) widget url can be resolved.
pub(super) fn check_widget_url(widget_url: &str) -> crate::Result<()> {
    Url::parse("http://localhost/")
        .and_then(|base| base.join(widget_url))
        .map(drop)
        .map_err(|err| crate::Error::config(format!("invalid widgetUrl {widget_url}: {err}")))
}

struct Query<'a> {
    pairs: Vec<(Cow<'a, str>, Cow<'a, str>)>,
}

impl<'a> Query<'a> {
    fn parse(parts: &'a Parts) -> Self {
        let pairs = parts
            .uri
            .query()
            .map(|query| url::form_urlencoded::parse(query.as_bytes()).collect())
            .unwrap_or_default();

        Self { pairs }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| &**value)
            .filter(|value| !value.is_empty())
    }
}

impl Client {
    /// Requests an out-of-band code for the widget action in `parts`, and builds the
    /// link to send to the user.
    ///
    /// The link is the widget url resolved against the request's own url, with the
    /// action and code added to its query.
    pub async fn generate_oob_code(
        &self,
        parts: &Parts,
        user_ip: Option<&str>,
    ) -> crate::Result<OobCodeResponse> {
        let query = Query::parse(parts);

        let action_param = query.get(OOB_ACTION_PARAM).unwrap_or_default();
        let action = OobAction::from_param(action_param).ok_or_else(|| {
            crate::Error::invalid_request(format!("unrecognized action: {action_param}"))
        })?;

        let mut request = GetOobCodeRequest::new(action.request_type());
        request.email = query.get(OOB_EMAIL_PARAM);
        request.user_ip = user_ip;

        match action {
            OobAction::ResetPassword => {
                request.captcha_challenge = query.get(OOB_CAPTCHA_CHALLENGE_PARAM);
                request.captcha_response = query.get(OOB_CAPTCHA_RESPONSE_PARAM);
            }
            OobAction::ChangeEmail => {
                request.new_email = query.get(OOB_NEW_EMAIL_PARAM);
                request.id_token = self.token_from_request(&parts.headers);
            }
        }

        // the api validates which fields each action needs
        let response = self.api().get_oob_code(&request).await?;

        let mut oob_code_url = request_url(parts)?
            .join(&self.config().widget_url)
            .map_err(|err| crate::Error::config(format!("invalid widgetUrl: {err}")))?;

        set_query_params(
            &mut oob_code_url,
            &[
                (&*self.config().widget_mode_param_name, action.as_str()),
                (OOB_CODE_PARAM, &*response.oob_code),
            ],
        );

        Ok(OobCodeResponse {
            action,
            email: Box::from(request.email.unwrap_or_default()),
            new_email: request.new_email.map(Box::from),
            oob_code: response.oob_code,
            oob_code_url,
        })
    }
}

/// Rebuilds the url the request was made to. Behind a proxy the scheme comes from
/// `x-forwarded-proto`, and defaults to http otherwise.
fn request_url(parts: &Parts) -> crate::Result<Url> {
    let scheme = parts
        .headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.scheme_str())
        .unwrap_or("http");

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
        .ok_or_else(|| crate::Error::invalid_request("request has no host"))?;

    Url::parse(&format!("{scheme}://{host}{}", parts.uri.path()))
        .map_err(|err| crate::Error::invalid_request(format!("invalid request url: {err}")))
}

/// Sets query parameters, replacing any existing values with the same name.
fn set_query_params(url: &mut Url, params: &[(&str, &str)]) {
    let kept = url
        .query_pairs()
        .filter(|(key, _)| !params.iter().any(|(name, _)| *name == *key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect::<Vec<_>>();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .extend_pairs(params);
}
