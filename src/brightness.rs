//! Write-through brightness cache with coalesced fallback retrieval.

use std::collections::HashMap;
use std::future::Future;

use log::debug;
use tokio::sync::{Mutex, watch};

use crate::errors::Error;

/// Brightness assumed for a device nobody has ever observed.
const DEFAULT_BRIGHTNESS: i64 = 50;

#[derive(Default)]
struct Inner {
    values: HashMap<String, i64>,
    // One entry per fallback retrieval currently in flight; followers wait
    // on the receiver instead of issuing their own fetch.
    in_flight: HashMap<String, watch::Receiver<Option<i64>>>,
}

/// Per-device last-known brightness (0-100).
///
/// Values are written whenever the bridge sets or observes a brightness. On
/// a cache miss, concurrent callers for the same device are coalesced into
/// exactly one invocation of the caller-supplied retrieval function; every
/// caller observes the same result. A failed retrieval falls back to
/// [`DEFAULT_BRIGHTNESS`] without poisoning the cache, so a later fetch is
/// still attempted.
#[derive(Default)]
pub struct BrightnessCache {
    inner: Mutex<Inner>,
}

impl BrightnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally overwrite the cached brightness for a device.
    pub async fn set_for_device(&self, device: &str, value: i64) {
        self.inner
            .lock()
            .await
            .values
            .insert(device.to_string(), value);
    }

    /// The cached brightness, or the fixed default when the device has never
    /// been observed and no retrieval function is available.
    pub async fn get(&self, device: &str) -> i64 {
        self.inner
            .lock()
            .await
            .values
            .get(device)
            .copied()
            .unwrap_or(DEFAULT_BRIGHTNESS)
    }

    /// The cached brightness, or the result of `on_miss` on a miss.
    ///
    /// The first caller for an uncached device runs `on_miss`; callers
    /// arriving while that fetch is in flight wait for its result instead of
    /// fetching again. A successful result is cached before the waiters are
    /// released.
    pub async fn get_or_fetch<F, Fut>(&self, device: &str, on_miss: F) -> i64
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<i64, Error>>,
    {
        let tx = {
            let mut inner = self.inner.lock().await;
            if let Some(value) = inner.values.get(device) {
                return *value;
            }
            if let Some(rx) = inner.in_flight.get(device) {
                let mut rx = rx.clone();
                drop(inner);
                return match rx.wait_for(|v| v.is_some()).await {
                    Ok(value) => (*value).unwrap_or(DEFAULT_BRIGHTNESS),
                    // The leader went away without resolving; assume default.
                    Err(_) => DEFAULT_BRIGHTNESS,
                };
            }
            let (tx, rx) = watch::channel(None);
            inner.in_flight.insert(device.to_string(), rx);
            tx
        };

        // Leader path: fetch without holding the lock.
        let result = on_miss(device.to_string()).await;

        let value = {
            let mut inner = self.inner.lock().await;
            inner.in_flight.remove(device);
            match result {
                Ok(value) => {
                    inner.values.insert(device.to_string(), value);
                    value
                }
                Err(err) => {
                    debug!("brightness retrieval for [{device}] failed: {err}; assuming default");
                    DEFAULT_BRIGHTNESS
                }
            }
        };

        let _ = tx.send(Some(value));
        value
    }
}
