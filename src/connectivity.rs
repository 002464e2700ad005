//! Reachability monitor: single source of truth for "is the device online".
//!
//! Status is a lightweight probe against the backend, cached briefly so hot
//! paths can ask cheaply. Transitions are pushed through a watch channel,
//! which also deduplicates no-op transitions so listeners only wake on real
//! changes.

use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL: Duration = Duration::from_secs(5);

pub struct ConnectivityMonitor {
    http: Client,
    probe_url: Url,
    state_tx: watch::Sender<bool>,
    // (checked_at, result) of the last probe.
    cached: Mutex<Option<(Instant, bool)>>,
}

impl ConnectivityMonitor {
    pub fn new(probe_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("agroscout/0.1")
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("reqwest client");
        let (state_tx, _) = watch::channel(false);
        Self {
            http,
            probe_url,
            state_tx,
            cached: Mutex::new(None),
        }
    }

    /// Point-in-time check. Probe failures mean "offline", never an error.
    pub async fn is_online(&self) -> bool {
        {
            let cached = self.cached.lock().await;
            if let Some((at, online)) = *cached {
                if at.elapsed() < CACHE_TTL {
                    return online;
                }
            }
        }
        let online = self.probe().await;
        *self.cached.lock().await = Some((Instant::now(), online));
        self.publish(online);
        online
    }

    /// Feed an externally observed reachability change, e.g. a host OS
    /// callback. Updates the cache and notifies subscribers on transition.
    pub async fn report(&self, online: bool) {
        *self.cached.lock().await = Some((Instant::now(), online));
        self.publish(online);
    }

    fn publish(&self, online: bool) {
        self.state_tx.send_if_modified(|state| {
            if *state != online {
                info!(online, "connectivity changed");
                *state = online;
                true
            } else {
                false
            }
        });
    }

    /// Receives `true`/`false` on every observed transition; no-op
    /// transitions are not delivered.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Background poller keeping the watch channel fresh even when nobody
    /// calls [`is_online`].
    pub fn spawn_poller(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                // Bypass the cache so the poll observes real transitions.
                *self.cached.lock().await = None;
                let _ = self.is_online().await;
            }
        })
    }

    async fn probe(&self) -> bool {
        // Any response at all means the backend is reachable; status codes
        // are a concern for the actual calls, not for reachability.
        match self.http.head(self.probe_url.clone()).send().await {
            Ok(_) => true,
            Err(err) => {
                debug!(?err, "connectivity probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_monitor() -> ConnectivityMonitor {
        // TEST-NET-1 address; the probe times out or refuses, either way the
        // monitor must report offline rather than error.
        ConnectivityMonitor::new(Url::parse("http://192.0.2.1:9/").unwrap())
    }

    #[tokio::test]
    async fn probe_failure_means_offline() {
        let monitor = unreachable_monitor();
        assert!(!monitor.is_online().await);
    }

    #[tokio::test]
    async fn repeated_checks_hit_the_cache() {
        let monitor = unreachable_monitor();
        let _ = monitor.is_online().await;
        let start = Instant::now();
        let _ = monitor.is_online().await;
        // Second call must come from the cache, not a fresh (slow) probe.
        assert!(start.elapsed() < PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn reported_state_feeds_cache_and_subscribers() {
        let monitor = unreachable_monitor();
        let mut rx = monitor.subscribe();
        monitor.report(true).await;
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        // The report also primes the cache, so this is a fast cache hit, not
        // a probe against the unreachable address.
        let start = Instant::now();
        assert!(monitor.is_online().await);
        assert!(start.elapsed() < PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn subscribers_only_see_transitions() {
        let monitor = unreachable_monitor();
        let rx = monitor.subscribe();
        // Initial state is offline; an offline probe result is a no-op
        // transition and must not wake the receiver.
        let _ = monitor.is_online().await;
        assert!(!rx.has_changed().unwrap());
    }
}
