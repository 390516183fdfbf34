use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::time::Instant;

type HmacSha256 = Hmac<Sha256>;

/// Request signing material for the exchange's private endpoints
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() || self.api_secret.is_empty()
    }

    /// Hex HMAC-SHA256 over `timestamp + api_key + recv_window + payload`,
    /// where payload is the JSON body for POST or the sorted query string
    /// for GET.
    pub fn sign(&self, timestamp_ms: i64, recv_window_ms: u64, payload: &str) -> String {
        let prehash = format!("{}{}{}{}", timestamp_ms, self.api_key, recv_window_ms, payload);
        // HMAC accepts keys of any length, so construction cannot fail.
        let mut mac = match HmacSha256::new_from_slice(self.api_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Query string with keys sorted, as both sent and signed
pub fn sorted_query(params: &[(&str, String)]) -> String {
    let mut pairs: Vec<&(&str, String)> = params.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Rolling count of authentication failures.
///
/// Once `threshold` failures land inside `window` the tracker latches into
/// the degraded state and stays there for the life of the process.
#[derive(Debug)]
pub struct AuthFailureTracker {
    failures: Mutex<VecDeque<Instant>>,
    threshold: usize,
    window: Duration,
    degraded: AtomicBool,
}

impl AuthFailureTracker {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            failures: Mutex::new(VecDeque::new()),
            threshold: threshold.max(1),
            window,
            degraded: AtomicBool::new(false),
        }
    }

    /// Record a failure; returns true if this one tipped the tracker into
    /// the degraded state.
    pub fn record_failure(&self) -> bool {
        let now = Instant::now();
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());

        while let Some(&front) = failures.front() {
            if now.duration_since(front) >= self.window {
                failures.pop_front();
            } else {
                break;
            }
        }
        failures.push_back(now);

        if failures.len() >= self.threshold && !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::error!(
                "{} authentication failures within {:?}; suspending authenticated calls",
                failures.len(),
                self.window
            );
            return true;
        }
        false
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn recent_failures(&self) -> usize {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}
