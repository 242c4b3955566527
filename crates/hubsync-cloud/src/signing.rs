//! Request signing.
//!
//! Every REST call and the push-stream login carry a timestamp and a
//! signature over the method, the sorted parameters and the account
//! identity. The server rejects timestamps outside a small window, so the
//! clock is injectable and the window is checked locally before sending.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use hubsync_core::config::AccountConfig;
use hubsync_core::{Error, Result};

use crate::codes;

type HmacSha256 = Hmac<Sha256>;

/// Source of the current time, seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_secs(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Produces the `sign` field for a request.
pub trait SigningPolicy: Send + Sync {
    fn sign(&self, method: &str, timestamp: i64, params: &Value) -> Result<String>;
}

/// HMAC-SHA256 over the canonical request string, keyed with the app token,
/// hex encoded.
pub struct HmacSha256Signer {
    account: AccountConfig,
}

impl HmacSha256Signer {
    pub fn new(account: AccountConfig) -> Self {
        Self { account }
    }

    /// `method:M,<k>:<v>,...,time:T,userid:U,usertoken:UT,appkey:AK` with
    /// parameters in key order.
    pub fn canonical(&self, method: &str, timestamp: i64, params: &Value) -> String {
        let mut out = format!("method:{}", method);
        if let Value::Object(map) = params {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                out.push(',');
                out.push_str(key);
                out.push(':');
                out.push_str(&canonical_value(&map[key.as_str()]));
            }
        }
        out.push_str(&format!(
            ",time:{},userid:{},usertoken:{},appkey:{}",
            timestamp, self.account.user_id, self.account.user_token, self.account.app_key
        ));
        out
    }
}

fn canonical_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl SigningPolicy for HmacSha256Signer {
    fn sign(&self, method: &str, timestamp: i64, params: &Value) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.account.app_token.as_bytes())
            .map_err(|_| Error::Auth("invalid app token".to_string()))?;
        mac.update(self.canonical(method, timestamp, params).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Accepted distance between a request timestamp and the local clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureWindow {
    pub tolerance_secs: i64,
}

impl Default for SignatureWindow {
    fn default() -> Self {
        Self { tolerance_secs: 300 }
    }
}

impl SignatureWindow {
    pub fn new(tolerance_secs: i64) -> Self {
        Self { tolerance_secs }
    }

    pub fn is_fresh(&self, timestamp: i64, now: i64) -> bool {
        (now - timestamp).abs() <= self.tolerance_secs
    }

    pub fn check(&self, timestamp: i64, now: i64) -> Result<()> {
        if self.is_fresh(timestamp, now) {
            Ok(())
        } else {
            Err(Error::protocol(
                codes::STALE_TIMESTAMP,
                format!(
                    "timestamp {} is {}s away from local clock (tolerance {}s)",
                    timestamp,
                    (now - timestamp).abs(),
                    self.tolerance_secs
                ),
            ))
        }
    }
}

/// Time and signature for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub time: i64,
    pub sign: String,
}

/// Signing policy, clock and window bundled for the clients.
#[derive(Clone)]
pub struct RequestSigner {
    policy: Arc<dyn SigningPolicy>,
    clock: Arc<dyn Clock>,
    window: SignatureWindow,
}

impl RequestSigner {
    pub fn new(policy: Arc<dyn SigningPolicy>, clock: Arc<dyn Clock>, window: SignatureWindow) -> Self {
        Self {
            policy,
            clock,
            window,
        }
    }

    /// HMAC signer on the wall clock.
    pub fn for_account(account: &AccountConfig, tolerance_secs: i64) -> Self {
        Self::new(
            Arc::new(HmacSha256Signer::new(account.clone())),
            Arc::new(SystemClock),
            SignatureWindow::new(tolerance_secs),
        )
    }

    pub fn stamp(&self, method: &str, params: &Value) -> Result<Stamp> {
        let time = self.clock.now_secs();
        let sign = self.policy.sign(method, time, params)?;
        Ok(Stamp { time, sign })
    }

    /// Whether a stamp is still inside the window.
    pub fn is_fresh(&self, stamp: &Stamp) -> bool {
        self.window.is_fresh(stamp.time, self.clock.now_secs())
    }

    pub fn check(&self, stamp: &Stamp) -> Result<()> {
        self.window.check(stamp.time, self.clock.now_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account() -> AccountConfig {
        AccountConfig {
            app_key: "key".into(),
            app_token: "token".into(),
            user_id: "1001".into(),
            user_token: "ut".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_canonical_sorts_params() {
        let signer = HmacSha256Signer::new(account());
        let canonical = signer.canonical("EpSet", 1_700_000_000, &json!({ "me": "2d11", "agt": "A1", "val": 1 }));
        assert_eq!(
            canonical,
            "method:EpSet,agt:A1,me:2d11,val:1,time:1700000000,userid:1001,usertoken:ut,appkey:key"
        );
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let signer = HmacSha256Signer::new(account());
        let a = signer.sign("EpGetAll", 10, &json!({})).unwrap();
        let b = signer.sign("EpGetAll", 10, &json!({})).unwrap();
        let c = signer.sign("EpGetAll", 11, &json!({})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_window_rejects_stale_stamp() {
        let clock = Arc::new(FixedClock::new(1_000));
        let signer = RequestSigner::new(
            Arc::new(HmacSha256Signer::new(account())),
            clock.clone(),
            SignatureWindow::new(300),
        );
        let stamp = signer.stamp("EpSet", &json!({})).unwrap();
        assert_eq!(stamp.time, 1_000);
        assert!(signer.check(&stamp).is_ok());

        clock.advance(301);
        assert!(!signer.is_fresh(&stamp));
        let err = signer.check(&stamp).unwrap_err();
        assert_eq!(err.class(), hubsync_core::ErrorClass::Protocol);
    }
}
