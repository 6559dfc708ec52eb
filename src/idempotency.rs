// src/idempotency.rs
use crate::{LedgerAdapter, LedgerEntry, Result, UserId, WalletError};
use chrono::{DateTime, SubsecRound, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub const MAX_KEY_LEN: usize = 255;

/// Status stored for transient failures. A record holding it does not pin
/// the key: a retry of the same request claims it again and re-executes.
pub const RETRYABLE_STATUS: u16 = 503;

/// A finished response, replayed verbatim for retries of the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl StoredResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self { status, body }
    }

    pub fn from_error(err: &WalletError) -> Self {
        Self::new(err.status(), err.to_response_body())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Taken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    /// The caller owns the key and must run the operation, then
    /// `save_response`.
    New,
    /// The operation already ran; replay this instead.
    Replay(StoredResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub user_id: UserId,
    pub request_path: String,
    pub request_body: serde_json::Value,
    pub request_fingerprint: String,
    pub response_status: Option<u16>,
    pub response_body: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(
        key: &str,
        user_id: UserId,
        request_path: &str,
        request_body: &serde_json::Value,
        ttl: chrono::Duration,
    ) -> Self {
        let created_at = Utc::now().trunc_subsecs(6);
        Self {
            key: key.to_string(),
            user_id,
            request_path: request_path.to_string(),
            request_body: request_body.clone(),
            request_fingerprint: fingerprint(user_id, request_path, request_body),
            response_status: None,
            response_body: None,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.response_status.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `claimant` may take this live record over: it completed with
    /// a transient failure and `claimant` is the same request.
    pub fn is_reclaimable_by(&self, claimant: &IdempotencyRecord) -> bool {
        self.response_status == Some(RETRYABLE_STATUS)
            && self.request_fingerprint == claimant.request_fingerprint
    }

    pub fn response(&self) -> Option<StoredResponse> {
        match (self.response_status, &self.response_body) {
            (Some(status), Some(body)) => Some(StoredResponse::new(status, body.clone())),
            _ => None,
        }
    }
}

/// BLAKE3 digest identifying who sent what to where.
pub(crate) fn fingerprint(user_id: UserId, path: &str, body: &serde_json::Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(user_id.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(WalletError::Validation(
            "idempotency key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(WalletError::Validation(format!(
            "idempotency key longer than {} bytes",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// Deduplicates mutating calls by client-supplied key.
///
/// The unique insert in [`IdempotencyStore::claim`](crate::adapters::IdempotencyStore::claim)
/// decides who executes; everybody else either replays the completed
/// response or gets `IdempotencyConflict` while the owner is in flight.
pub struct IdempotencyCoordinator {
    adapter: Arc<dyn LedgerAdapter>,
    ttl: chrono::Duration,
}

impl IdempotencyCoordinator {
    pub fn new(adapter: Arc<dyn LedgerAdapter>, ttl: Duration) -> Self {
        Self {
            adapter,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::days(1)),
        }
    }

    pub async fn check_and_register(
        &self,
        key: &str,
        user_id: UserId,
        request_path: &str,
        request_body: &serde_json::Value,
    ) -> Result<Registration> {
        validate_key(key)?;
        let record = IdempotencyRecord::pending(key, user_id, request_path, request_body, self.ttl);

        let mut retrying = false;
        if let Some(existing) = self.adapter.find_live(key, record.created_at).await? {
            if !existing.is_reclaimable_by(&record) {
                return self.resolve(existing, &record.request_fingerprint);
            }
            retrying = true;
        }

        match self.adapter.claim(&record).await? {
            ClaimOutcome::Claimed => {
                let outcome = if retrying { "retry" } else { "new" };
                counter!("wallet.idempotency.requests", "outcome" => outcome).increment(1);
                if retrying {
                    info!(key, "re-executing after a transient failure");
                }
                Ok(Registration::New)
            }
            ClaimOutcome::Taken => match self.adapter.find_live(key, Utc::now()).await? {
                Some(existing) => self.resolve(existing, &record.request_fingerprint),
                // The winner's record expired between our insert and re-read.
                None => Err(self.conflict(key)),
            },
        }
    }

    fn resolve(&self, existing: IdempotencyRecord, fingerprint: &str) -> Result<Registration> {
        if existing.request_fingerprint != fingerprint {
            counter!("wallet.idempotency.requests", "outcome" => "mismatch").increment(1);
            warn!(key = %existing.key, "idempotency key reused with a different request");
            return Err(WalletError::IdempotencyKeyMismatch(existing.key));
        }

        match existing.response() {
            Some(response) => {
                counter!("wallet.idempotency.requests", "outcome" => "replay").increment(1);
                info!(key = %existing.key, status = response.status, "replaying stored response");
                Ok(Registration::Replay(response))
            }
            None => Err(self.conflict(&existing.key)),
        }
    }

    fn conflict(&self, key: &str) -> WalletError {
        counter!("wallet.idempotency.requests", "outcome" => "conflict").increment(1);
        warn!(key = %key, "request with the same idempotency key still in flight");
        WalletError::IdempotencyConflict(key.to_string())
    }

    pub async fn save_response(&self, key: &str, response: &StoredResponse) -> Result<()> {
        self.adapter.complete(key, response, Utc::now()).await
    }

    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self.adapter.delete_expired(Utc::now()).await?;
        counter!("wallet.idempotency.expired").increment(removed);
        Ok(removed)
    }
}

/// Runs `cleanup_expired` every `interval` until the handle is aborted.
pub fn spawn_expiry_sweeper(
    coordinator: Arc<IdempotencyCoordinator>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match coordinator.cleanup_expired().await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "swept expired idempotency records"),
                Err(err) => warn!(error = %err, "idempotency sweep failed"),
            }
        }
    })
}

/// Outcome of a `createTransaction` call as the request layer renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub replayed: bool,
}

impl IdempotentResponse {
    pub(crate) fn fresh(response: StoredResponse) -> Self {
        Self {
            status: response.status,
            body: response.body,
            replayed: false,
        }
    }

    pub(crate) fn replayed(response: StoredResponse) -> Self {
        Self {
            status: response.status,
            body: response.body,
            replayed: true,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The created entry, for successful responses.
    pub fn entry(&self) -> Option<LedgerEntry> {
        if !self.is_success() {
            return None;
        }
        serde_json::from_value(self.body.clone()).ok()
    }

    pub fn error_code(&self) -> Option<&str> {
        self.body.get("code").and_then(|code| code.as_str())
    }
}
