use std::borrow::Cow;
use std::time::Duration;

use fxhash::{FxBuildHasher, FxHashMap};
use http::{HeaderMap, StatusCode, header};
use serde::de;

use super::{Certificate, KeyId};
use crate::transport::Transport;

pub type CertMap = FxHashMap<KeyId, Certificate>;

/// Used when the endpoint doesn't tell us how long its certificates are good for.
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(60 * 60);

pub(super) struct Fetched {
    pub(super) certs: CertMap,
    pub(super) max_age: Duration,
}

/// Downloads and parses the certificates, returning them along with how long to cache them.
pub(super) async fn download_certs(
    url: &reqwest::Url,
    transport: &dyn Transport,
) -> crate::Result<Fetched> {
    let request = reqwest::Request::new(reqwest::Method::GET, url.clone());
    let response = transport.execute(request).await?;

    if response.status() != StatusCode::OK {
        return Err(crate::error::StatusError::from_response(response)
            .await?
            .into());
    }

    let max_age = cache_time(response.headers());
    let body = response.bytes().await?;
    let certs = parse_certs(&body)?;

    Ok(Fetched { certs, max_age })
}

/// Extracts the cache duration from a `Cache-Control` header, i.e
/// `public, max-age=19204, must-revalidate, no-transform`.
///
/// Falls back to [`DEFAULT_CACHE_TIME`] if there's no well formed `max-age` directive.
pub fn cache_time(headers: &HeaderMap) -> Duration {
    fn parse_max_age(header: &header::HeaderValue) -> Option<Duration> {
        let str = header.to_str().ok()?;

        let max_age_str = str
            .split_terminator(',')
            .map(str::trim)
            .find_map(|s| s.strip_prefix("max-age="))?;

        let max_age_secs = max_age_str.parse::<u64>().ok()?;

        Some(Duration::from_secs(max_age_secs))
    }

    headers
        .get(header::CACHE_CONTROL)
        .and_then(parse_max_age)
        .unwrap_or(DEFAULT_CACHE_TIME)
}

/// Parses a json map of key id to PEM encoded certificate. Any invalid certificate fails
/// the entire map.
pub(super) fn parse_certs(body: &[u8]) -> Result<CertMap, serde_json::Error> {
    let mut certs = FxHashMap::with_capacity_and_hasher(4, FxBuildHasher::default());

    let mut deserializer = serde_json::Deserializer::from_slice(body);
    de::DeserializeSeed::deserialize(CertsVisitor { certs: &mut certs }, &mut deserializer)?;
    deserializer.end()?;

    Ok(certs)
}

struct CertsVisitor<'a> {
    certs: &'a mut CertMap,
}

impl<'de> de::DeserializeSeed<'de> for CertsVisitor<'_> {
    type Value = ();

    #[inline]
    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_map(self)
    }
}

impl<'de> de::Visitor<'de> for CertsVisitor<'_> {
    type Value = ();

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a json map of kid -> pem certificate")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: de::MapAccess<'de>,
    {
        while let Some((key_id, pem)) = map.next_entry::<Cow<'de, str>, Cow<'de, str>>()? {
            let cert = Certificate::from_pem(&pem).map_err(|err| {
                de::Error::custom(format_args!("invalid certificate for key id {key_id}: {err}"))
            })?;

            self.certs.insert(KeyId::from(key_id.into_owned()), cert);
        }

        Ok(())
    }
}
