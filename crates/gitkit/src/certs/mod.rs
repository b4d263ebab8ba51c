//! Self refreshing cache of the identity toolkit's public signing certificates.
use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

mod certificate;
mod fetch;

pub use certificate::{Certificate, KeyId};
pub use fetch::{CertMap, DEFAULT_CACHE_TIME, cache_time};

use crate::transport::Transport;

/// How long to wait before retrying after a failed refresh.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, thiserror::Error)]
pub enum CertError {
    #[error("certificate not found for key id {0}")]
    NotFound(KeyId),
    #[error("failed to refresh certificates: {0}")]
    Refresh(#[source] Arc<crate::Error>),
}

/// Anything that can look up a signing certificate by its key id.
pub trait CertificateSource: Send + Sync {
    fn certificate(
        &self,
        key_id: &str,
    ) -> impl Future<Output = Result<Certificate, CertError>> + Send;
}

impl<S> CertificateSource for HashMap<Box<str>, Certificate, S>
where
    S: BuildHasher + Send + Sync,
{
    async fn certificate(&self, key_id: &str) -> Result<Certificate, CertError> {
        self.get(key_id)
            .cloned()
            .ok_or_else(|| CertError::NotFound(KeyId::from(key_id)))
    }
}

/// The set of available public certificates, indexed by key id.
///
/// Certificates are refreshed in the background according to the `Cache-Control` header
/// of the endpoint, or every [`RETRY_INTERVAL`] while refreshing fails. Clones share the
/// same cache, and the background refresh stops once every clone is dropped.
#[derive(Clone)]
pub struct Certificates {
    shared: Arc<Shared>,
}

struct Shared {
    url: reqwest::Url,
    transport: Arc<dyn Transport>,
    state: RwLock<CacheState>,
    refresher: Mutex<Option<JoinHandle<()>>>,
    first_load: tokio::sync::Mutex<()>,
    /// Held from fetch to install, so an older download never replaces a newer one.
    refreshing: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct CacheState {
    certs: Arc<CertMap>,
    last_error: Option<Arc<crate::Error>>,
    loaded: bool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = self.refresher.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Certificates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(state) = self.shared.state.try_read() else {
            return f.debug_struct("Certificates").finish_non_exhaustive();
        };

        f.debug_struct("Certificates")
            .field("url", &self.shared.url.as_str())
            .field("keys", &state.certs.keys().collect::<Vec<_>>())
            .field("last_error", &state.last_error)
            .finish()
    }
}

impl Certificates {
    /// Downloads the certificates, failing if the first fetch fails.
    pub async fn load(url: reqwest::Url, transport: Arc<dyn Transport>) -> crate::Result<Self> {
        let this = Self::lazy(url, transport);

        let fetched = fetch::download_certs(&this.shared.url, &*this.shared.transport).await?;
        let delay = this.shared.install(fetched);
        this.schedule(delay);

        Ok(this)
    }

    /// Builds an empty cache, deferring the first download until
    /// [`Certificates::load_if_necessary`] (or a lookup through [`CertificateSource`]).
    pub fn lazy(url: reqwest::Url, transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url,
                transport,
                state: RwLock::new(CacheState::default()),
                refresher: Mutex::new(None),
                first_load: tokio::sync::Mutex::new(()),
                refreshing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.shared.url
    }

    /// Triggers the first download, if one hasn't happened yet. This is a no-op once
    /// certificates were loaded, or once the background refresh is running.
    ///
    /// Even if this fails, the background refresh will keep retrying.
    pub async fn load_if_necessary(&self) -> Result<(), CertError> {
        if self.is_running() {
            return Ok(());
        }

        let _guard = self.shared.first_load.lock().await;

        // someone else may have loaded while we waited on the lock
        if self.is_running() {
            return Ok(());
        }

        self.refresh_now().await
    }

    /// Refreshes immediately, replacing any pending scheduled refresh.
    pub async fn refresh_now(&self) -> Result<(), CertError> {
        let result = self.shared.refresh().await;

        self.schedule(match result {
            Ok(max_age) => max_age,
            Err(_) => RETRY_INTERVAL,
        });

        result.map(|_| ()).map_err(CertError::Refresh)
    }

    /// Returns the certificate for the given key id.
    ///
    /// If the key id isn't known and the last refresh failed, that error is returned
    /// instead, since it likely explains the missing key.
    pub fn cert(&self, key_id: &str) -> Result<Certificate, CertError> {
        let state = self.shared.state.read();

        match state.certs.get(key_id) {
            Some(cert) => Ok(cert.clone()),
            None => match state.last_error {
                Some(ref error) => Err(CertError::Refresh(Arc::clone(error))),
                None => Err(CertError::NotFound(KeyId::from(key_id))),
            },
        }
    }

    /// The key ids of the currently installed certificates, sorted.
    pub fn key_ids(&self) -> Vec<KeyId> {
        let certs = Arc::clone(&self.shared.state.read().certs);
        let mut key_ids = certs.keys().cloned().collect::<Vec<_>>();
        key_ids.sort_unstable();
        key_ids
    }

    /// The error from the last refresh, if it failed.
    pub fn last_error(&self) -> Option<Arc<crate::Error>> {
        self.shared.state.read().last_error.clone()
    }

    fn is_running(&self) -> bool {
        self.shared.state.read().loaded || self.shared.refresher.lock().is_some()
    }

    fn schedule(&self, delay: Duration) {
        let handle = tokio::spawn(refresh_loop(Arc::downgrade(&self.shared), delay));

        let previous = self.shared.refresher.lock().replace(handle);

        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl Shared {
    /// Swaps in a freshly downloaded set of certificates, returning how long until they
    /// should be refreshed.
    fn install(&self, fetched: fetch::Fetched) -> Duration {
        let fetch::Fetched { certs, max_age } = fetched;
        let key_count = certs.len();
        let certs = Arc::new(certs);

        {
            let mut state = self.state.write();
            state.certs = certs;
            state.last_error = None;
            state.loaded = true;
        }

        tracing::debug!(
            message = "refreshed identity toolkit certificates",
            url = %self.url,
            key_count,
            next_refresh_secs = max_age.as_secs(),
        );

        max_age
    }

    async fn refresh(&self) -> Result<Duration, Arc<crate::Error>> {
        let _guard = self.refreshing.lock().await;

        match fetch::download_certs(&self.url, &*self.transport).await {
            Ok(fetched) => Ok(self.install(fetched)),
            Err(error) => {
                let error = Arc::new(error);
                self.state.write().last_error = Some(Arc::clone(&error));

                tracing::warn!(
                    message = "failed to refresh identity toolkit certificates, keeping previous ones",
                    url = %self.url,
                    error.display = %error,
                    retry_in_secs = RETRY_INTERVAL.as_secs(),
                );

                Err(error)
            }
        }
    }
}

async fn refresh_loop(shared: Weak<Shared>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;

        // the cache was dropped, nothing left to refresh
        let Some(shared) = shared.upgrade() else {
            return;
        };

        delay = match shared.refresh().await {
            Ok(max_age) => max_age,
            Err(_) => RETRY_INTERVAL,
        };
    }
}

impl CertificateSource for Certificates {
    async fn certificate(&self, key_id: &str) -> Result<Certificate, CertError> {
        if let Err(error) = self.load_if_necessary().await {
            // the lookup below surfaces the same error, if the key is missing
            tracing::debug!(message = "lazy certificate load failed", %error);
        }

        self.cert(key_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::testutil::{self, MockResponse, MockTransport};

    fn url() -> reqwest::Url {
        reqwest::Url::parse("https://certs.example.com/publicKeys").unwrap()
    }

    fn ok(certs: &[(&str, &str)], cache_control: &'static str) -> MockResponse {
        MockResponse::ok(testutil::certs_body(certs), Some(cache_control))
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_and_lookup() {
        let transport = MockTransport::new([ok(&[("40QoZg", testutil::CERT_A)], "max-age=3600")]);
        let certs = Certificates::load(url(), transport.clone()).await.unwrap();

        let cert = certs.cert("40QoZg").unwrap();
        assert_eq!(cert.pem(), testutil::CERT_A);

        // same cert, no refresh in between
        assert!(cert.same_instance(&certs.cert("40QoZg").unwrap()));

        match certs.cert("other") {
            Err(CertError::NotFound(key_id)) => assert_eq!(key_id.as_str(), "other"),
            other => panic!("expected not found, got {other:?}"),
        }

        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_failure() {
        let transport = MockTransport::new([MockResponse::status(503)]);
        let error = Certificates::load(url(), transport.clone()).await.unwrap_err();

        match error {
            crate::Error::Status(status) => assert_eq!(status.status().as_u16(), 503),
            other => panic!("expected a status error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_certs_and_retries() {
        let transport = MockTransport::new([
            ok(&[("40QoZg", testutil::CERT_A)], "public, max-age=7200"),
            MockResponse::status(500),
            ok(&[("5DaIwB", testutil::CERT_B)], "public"),
        ]);

        let certs = Certificates::load(url(), transport.clone()).await.unwrap();
        assert_eq!(transport.request_count(), 1);

        tokio::time::sleep(Duration::from_secs(7201)).await;
        assert_eq!(transport.request_count(), 2);

        // still serving the previous certificates
        assert_eq!(certs.cert("40QoZg").unwrap().pem(), testutil::CERT_A);
        assert!(certs.last_error().is_some());

        // unknown keys now surface the refresh error
        assert!(matches!(certs.cert("other"), Err(CertError::Refresh(_))));

        // retried after 30 seconds, not after the previous max-age
        tokio::time::sleep(Duration::from_secs(28)).await;
        assert_eq!(transport.request_count(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.request_count(), 3);

        assert_eq!(certs.key_ids(), vec![KeyId::from("5DaIwB")]);
        assert!(certs.last_error().is_none());
        assert!(matches!(certs.cert("40QoZg"), Err(CertError::NotFound(_))));

        // no max-age, so the default hour applies
        tokio::time::sleep(DEFAULT_CACHE_TIME - Duration::from_secs(2)).await;
        assert_eq!(transport.request_count(), 3);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.request_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_replaces_pending_timer() {
        let transport = MockTransport::new([
            ok(&[("40QoZg", testutil::CERT_A)], "max-age=100"),
            ok(&[("40QoZg", testutil::CERT_A)], "max-age=10000"),
        ]);

        let certs = Certificates::load(url(), transport.clone()).await.unwrap();
        certs.refresh_now().await.unwrap();
        assert_eq!(transport.request_count(), 2);

        // the replaced timer would have fired here
        tokio::time::sleep(Duration::from_secs(101)).await;
        assert_eq!(transport.request_count(), 2);

        tokio::time::sleep(Duration::from_secs(10000)).await;
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refreshes_install_in_order() {
        let transport = MockTransport::new([
            ok(&[("40QoZg", testutil::CERT_A)], "max-age=3600"),
            // slow to answer, with what is stale by the time it arrives
            ok(&[("stale", testutil::CERT_A)], "max-age=3600").delayed(Duration::from_secs(5)),
            ok(&[("fresh", testutil::CERT_B)], "max-age=3600"),
        ]);

        let certs = Certificates::load(url(), transport.clone()).await.unwrap();

        let (first, second) = tokio::join!(certs.refresh_now(), certs.refresh_now());
        first.unwrap();
        second.unwrap();

        assert_eq!(transport.request_count(), 3);
        assert_eq!(certs.key_ids(), [KeyId::from("fresh")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_cache_stops_refreshing() {
        let transport = MockTransport::new([ok(&[("40QoZg", testutil::CERT_A)], "max-age=60")]);

        let certs = Certificates::load(url(), transport.clone()).await.unwrap();
        drop(certs);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_load() {
        let transport = MockTransport::new([ok(&[("40QoZg", testutil::CERT_A)], "max-age=3600")]);
        let certs = Certificates::lazy(url(), transport.clone());

        // nothing fetched yet, and a plain lookup doesn't fetch
        assert!(matches!(certs.cert("40QoZg"), Err(CertError::NotFound(_))));
        assert_eq!(transport.request_count(), 0);

        let cert = certs.certificate("40QoZg").await.unwrap();
        assert_eq!(cert.pem(), testutil::CERT_A);

        certs.load_if_necessary().await.unwrap();
        certs.certificate("40QoZg").await.unwrap();
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_load_failure_retries_in_background() {
        let transport = MockTransport::new([
            MockResponse::status(500),
            ok(&[("40QoZg", testutil::CERT_A)], "max-age=3600"),
        ]);
        let certs = Certificates::lazy(url(), transport.clone());

        assert!(matches!(certs.load_if_necessary().await, Err(CertError::Refresh(_))));
        assert!(matches!(certs.certificate("40QoZg").await, Err(CertError::Refresh(_))));

        // the refresh loop is running, so this doesn't fetch again
        certs.load_if_necessary().await.unwrap();
        assert_eq!(transport.request_count(), 1);

        tokio::time::sleep(RETRY_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(transport.request_count(), 2);
        assert_eq!(certs.certificate("40QoZg").await.unwrap().pem(), testutil::CERT_A);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lazy_loads_fetch_once() {
        let transport = MockTransport::new([ok(&[("40QoZg", testutil::CERT_A)], "max-age=3600")]);
        let certs = Certificates::lazy(url(), transport.clone());

        let lookups = (0..8).map(|_| certs.certificate("40QoZg"));
        for result in futures::future::join_all(lookups).await {
            assert_eq!(result.unwrap().pem(), testutil::CERT_A);
        }

        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readers_never_see_partial_map() {
        let old = [("k1", testutil::CERT_A), ("k2", testutil::CERT_B)];
        let new = [("k3", testutil::CERT_A), ("k4", testutil::CERT_B)];

        let transport = MockTransport::new([ok(&old, "max-age=3600"), ok(&new, "max-age=3600")]);
        let certs = Certificates::load(url(), transport).await.unwrap();

        let old_ids = vec![KeyId::from("k1"), KeyId::from("k2")];
        let new_ids = vec![KeyId::from("k3"), KeyId::from("k4")];

        let done = Arc::new(AtomicBool::new(false));

        let readers = (0..8)
            .map(|_| {
                let certs = certs.clone();
                let done = Arc::clone(&done);
                let (old_ids, new_ids) = (old_ids.clone(), new_ids.clone());

                std::thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        let ids = certs.key_ids();
                        assert!(ids == old_ids || ids == new_ids, "torn map: {ids:?}");
                    }
                })
            })
            .collect::<Vec<_>>();

        certs.refresh_now().await.unwrap();
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(certs.key_ids(), new_ids);
    }

    #[tokio::test]
    async fn test_static_map_source() {
        let mut map: HashMap<Box<str>, Certificate> = HashMap::new();
        map.insert(Box::from("pinned"), Certificate::from_pem(testutil::CERT_A).unwrap());

        assert!(map.certificate("pinned").await.is_ok());
        assert!(matches!(map.certificate("other").await, Err(CertError::NotFound(_))));
    }
}
