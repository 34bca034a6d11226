//! Account pool.
//!
//! Selection is sticky by session id: prompt-cache economics dominate
//! per-request cost, so a conversation keeps its account until that account
//! cools down. Cooldowns are per account *and* per model, because the
//! upstream meters Claude and Gemini quotas separately.
//!
//! All mutations run behind one async mutex and are written through to
//! `accounts.json` atomically, so an observer that sees a post-update read
//! never sees a pre-update selection.

use crate::atomic_write::write_atomic;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the stored expiry.
const TOKEN_REFRESH_SKEW_SECS: i64 = 300;

/// When every account is cooling, a cooldown younger than this is treated
/// as a brief blip and the sticky account is tried anyway.
const ALL_COOLED_TOLERANCE_SECS: i64 = 120;

const MAX_BACKOFF_MULTIPLIER: u64 = 16;

/// Per-model rate-limit state, persisted with the account.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_429_at: Option<i64>,
    #[serde(default)]
    pub consecutive_429s: u32,
}

impl RateLimitState {
    pub fn cooling(&self, now: i64) -> bool {
        self.cooldown_until.map(|t| t > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub email: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_expiry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl Account {
    fn cooling_for(&self, model: &str, now: i64) -> bool {
        self.rate_limits
            .get(model)
            .map(|s| s.cooling(now))
            .unwrap_or(false)
    }

    fn token_fresh(&self, now: i64) -> bool {
        match (&self.access_token, self.access_token_expiry) {
            (Some(token), Some(expiry)) => {
                !token.is_empty() && expiry > now + TOKEN_REFRESH_SKEW_SECS
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolFile {
    accounts: Vec<Account>,
}

struct PoolState {
    accounts: Vec<Account>,
    cursor: usize,
}

/// Multi-credential pool with sticky selection and per-model cooldowns.
pub struct AccountPool {
    path: PathBuf,
    cooldown_secs: u64,
    http: reqwest::Client,
    inner: Mutex<PoolState>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AccountPool {
    /// Load the pool from `accounts.json`. A missing or unreadable file
    /// starts an empty pool rather than failing startup.
    pub fn load(config: &GatewayConfig, http: reqwest::Client) -> Self {
        let path = config.accounts_path();
        let accounts = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<PoolFile>(&content) {
                Ok(file) => file.accounts,
                Err(err) => {
                    warn!(error = %err, ?path, "accounts file unreadable, starting empty");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        info!(accounts = accounts.len(), "account pool loaded");

        Self {
            path,
            cooldown_secs: config.cooldown_secs,
            http,
            inner: Mutex::new(PoolState {
                accounts,
                cursor: 0,
            }),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.accounts.is_empty()
    }

    /// Select an account for `model`, preferring the sticky candidate.
    ///
    /// Accounts in `exclude` (already tried this request) are skipped.
    /// When every usable account is cooling for the model and the oldest
    /// cooldown is under two minutes old, the sticky candidate is returned
    /// anyway rather than failing a conversation over a blip.
    pub async fn pick_next(
        &self,
        model: &str,
        session_id: &str,
        exclude: &[String],
    ) -> Option<Account> {
        let now = Utc::now().timestamp();
        let mut state = self.inner.lock().await;

        let usable = |a: &Account| !a.disabled && !exclude.contains(&a.email);

        let sticky = state
            .accounts
            .iter()
            .find(|a| usable(a) && a.last_session_id.as_deref() == Some(session_id))
            .cloned();

        if let Some(account) = &sticky {
            if !account.cooling_for(model, now) {
                debug!(email = %account.email, "sticky account selected");
                return sticky;
            }
        }

        // Round-robin over the rest, continuing from the previous cursor.
        let len = state.accounts.len();
        for offset in 0..len {
            let idx = (state.cursor + offset) % len;
            let candidate = {
                let account = &state.accounts[idx];
                (usable(account) && !account.cooling_for(model, now)).then(|| account.clone())
            };
            if let Some(account) = candidate {
                state.cursor = (idx + 1) % len;
                debug!(email = %account.email, "rotated to account");
                return Some(account);
            }
        }

        // Everyone is cooling. Tolerate a brief blip by retrying the
        // sticky candidate (or any usable account), but only while even
        // the oldest cooldown is still fresh.
        let oldest_429 = state
            .accounts
            .iter()
            .filter(|a| usable(a))
            .filter_map(|a| a.rate_limits.get(model).and_then(|s| s.last_429_at))
            .min()?;
        if now - oldest_429 < ALL_COOLED_TOLERANCE_SECS {
            let candidate = sticky.or_else(|| state.accounts.iter().find(|a| usable(a)).cloned());
            if let Some(account) = &candidate {
                debug!(email = %account.email, "all accounts cooling, tolerating blip");
            }
            return candidate;
        }

        None
    }

    /// Record a 429 for (account, model) and advance its cooldown.
    pub async fn on_rate_limited(
        &self,
        email: &str,
        model: &str,
        retry_after: Option<Duration>,
    ) {
        let now = Utc::now().timestamp();
        let base = self.cooldown_secs;
        {
            let mut state = self.inner.lock().await;
            let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) else {
                return;
            };
            let limits = account.rate_limits.entry(model.to_string()).or_default();
            limits.consecutive_429s = limits.consecutive_429s.saturating_add(1);
            limits.last_429_at = Some(now);

            let multiplier =
                (1u64 << (limits.consecutive_429s - 1).min(6)).min(MAX_BACKOFF_MULTIPLIER);
            let parsed = retry_after.map(|d| d.as_secs()).unwrap_or(0);
            let cooldown = parsed.max(base * multiplier);
            limits.cooldown_until = Some(now + cooldown as i64);
            warn!(
                email,
                model,
                cooldown_secs = cooldown,
                consecutive = limits.consecutive_429s,
                "account rate limited"
            );
        }
        self.persist().await;
    }

    /// Record a successful response: clears the backoff streak and binds
    /// the session to this account for sticky selection.
    pub async fn on_success(&self, email: &str, model: &str, session_id: &str) {
        {
            let mut state = self.inner.lock().await;
            let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) else {
                return;
            };
            account.last_session_id = Some(session_id.to_string());
            if let Some(limits) = account.rate_limits.get_mut(model) {
                limits.consecutive_429s = 0;
            }
        }
        self.persist().await;
    }

    /// Take the account out of rotation until an operator intervenes.
    pub async fn mark_disabled(&self, email: &str) {
        {
            let mut state = self.inner.lock().await;
            if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
                account.disabled = true;
                warn!(email, "account disabled");
            }
        }
        self.persist().await;
    }

    /// Current access token for the account, refreshing over OAuth when it
    /// is within the expiry skew. Concurrent refreshes for one account are
    /// deduplicated through a per-account lock.
    pub async fn get_token(&self, email: &str) -> Result<String, GatewayError> {
        if let Some(token) = self.fresh_token(email).await? {
            return Ok(token);
        }

        let lock = self.refresh_lock_for(email).await;
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        if let Some(token) = self.fresh_token(email).await? {
            return Ok(token);
        }

        self.refresh_access_token(email).await
    }

    async fn fresh_token(&self, email: &str) -> Result<Option<String>, GatewayError> {
        let now = Utc::now().timestamp();
        let state = self.inner.lock().await;
        let account = state
            .accounts
            .iter()
            .find(|a| a.email == email)
            .ok_or_else(|| GatewayError::Auth(format!("unknown account {}", email)))?;
        if account.disabled {
            return Err(GatewayError::Auth(format!("account {} is disabled", email)));
        }
        Ok(account
            .token_fresh(now)
            .then(|| account.access_token.clone())
            .flatten())
    }

    async fn refresh_lock_for(&self, email: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(email.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn refresh_access_token(&self, email: &str) -> Result<String, GatewayError> {
        let refresh_token = {
            let state = self.inner.lock().await;
            let account = state
                .accounts
                .iter()
                .find(|a| a.email == email)
                .ok_or_else(|| GatewayError::Auth(format!("unknown account {}", email)))?;
            account.refresh_token.clone()
        };
        if refresh_token.is_empty() {
            self.mark_disabled(email).await;
            return Err(GatewayError::Auth(format!(
                "account {} has no refresh token",
                email
            )));
        }

        let client_id = std::env::var("ANTIGRAVITY_CLIENT_ID").unwrap_or_default();
        let client_secret = std::env::var("ANTIGRAVITY_CLIENT_SECRET").unwrap_or_default();
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(GatewayError::Auth(
                "OAuth client credentials are not configured; \
                 set ANTIGRAVITY_CLIENT_ID and ANTIGRAVITY_CLIENT_SECRET"
                    .to_string(),
            ));
        }

        debug!(email, "refreshing access token");
        let response = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::Auth(format!("token refresh request failed: {}", e)))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Auth(format!("invalid token response: {}", e)))?;

        if !status.is_success() {
            let detail = body["error_description"]
                .as_str()
                .or_else(|| body["error"].as_str())
                .unwrap_or("unknown error");
            // A rejected refresh token will not heal on its own.
            if status.as_u16() == 400 || status.as_u16() == 401 {
                self.mark_disabled(email).await;
            }
            return Err(GatewayError::Auth(format!(
                "token refresh failed ({}): {}",
                status, detail
            )));
        }

        let access_token = body["access_token"].as_str().unwrap_or("").to_string();
        if access_token.is_empty() {
            return Err(GatewayError::Auth(
                "token refresh returned no access_token".to_string(),
            ));
        }
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600).max(60);
        let expiry = Utc::now().timestamp() + expires_in;

        {
            let mut state = self.inner.lock().await;
            if let Some(account) = state.accounts.iter_mut().find(|a| a.email == email) {
                account.access_token = Some(access_token.clone());
                account.access_token_expiry = Some(expiry);
            }
        }
        self.persist().await;
        Ok(access_token)
    }

    /// Project id for the upstream envelope.
    pub async fn project_id(&self, email: &str) -> Option<String> {
        let state = self.inner.lock().await;
        state
            .accounts
            .iter()
            .find(|a| a.email == email)
            .and_then(|a| a.project_id.clone())
    }

    /// Cooldown snapshot for `GET /account-limits`.
    pub async fn limits_snapshot(&self) -> Value {
        let now = Utc::now().timestamp();
        let state = self.inner.lock().await;
        let accounts: Vec<Value> = state
            .accounts
            .iter()
            .map(|a| {
                let models: serde_json::Map<String, Value> = a
                    .rate_limits
                    .iter()
                    .map(|(model, s)| {
                        (
                            model.clone(),
                            json!({
                                "cooling": s.cooling(now),
                                "cooldownUntil": s.cooldown_until,
                                "consecutive429s": s.consecutive_429s,
                            }),
                        )
                    })
                    .collect();
                json!({
                    "email": a.email,
                    "disabled": a.disabled,
                    "models": models,
                })
            })
            .collect();
        json!({"accounts": accounts})
    }

    async fn persist(&self) {
        let bytes = {
            let state = self.inner.lock().await;
            match serde_json::to_vec_pretty(&PoolFile {
                accounts: state.accounts.clone(),
            }) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "failed to serialize account pool");
                    return;
                }
            }
        };
        if let Err(err) = write_atomic(&self.path, &bytes, true) {
            warn!(error = %err, "failed to persist account pool");
        }
    }

    #[cfg(test)]
    async fn insert(&self, account: Account) {
        self.inner.lock().await.accounts.push(account);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn account(email: &str) -> Account {
        Account {
            email: email.to_string(),
            refresh_token: "rt".to_string(),
            access_token: None,
            access_token_expiry: None,
            project_id: None,
            rate_limits: HashMap::new(),
            last_session_id: None,
            disabled: false,
        }
    }

    async fn pool_with(dir: &std::path::Path, accounts: Vec<Account>) -> AccountPool {
        let config = GatewayConfig::for_dir(dir);
        let pool = AccountPool::load(&config, reqwest::Client::new());
        for a in accounts {
            pool.insert(a).await;
        }
        pool
    }

    #[tokio::test]
    async fn sticky_account_is_preferred() {
        let dir = tempdir().unwrap();
        let mut b = account("b@example.com");
        b.last_session_id = Some("sess".to_string());
        let pool = pool_with(dir.path(), vec![account("a@example.com"), b]).await;

        let picked = pool.pick_next("gemini-3-pro", "sess", &[]).await.unwrap();
        assert_eq!(picked.email, "b@example.com");
    }

    #[tokio::test]
    async fn cooling_sticky_rotates_to_next_account() {
        let dir = tempdir().unwrap();
        let mut a = account("a@example.com");
        a.last_session_id = Some("sess".to_string());
        a.rate_limits.insert(
            "gemini-3-pro".to_string(),
            RateLimitState {
                cooldown_until: Some(Utc::now().timestamp() + 300),
                last_429_at: Some(Utc::now().timestamp()),
                consecutive_429s: 1,
            },
        );
        let pool = pool_with(dir.path(), vec![a, account("b@example.com")]).await;

        let picked = pool.pick_next("gemini-3-pro", "sess", &[]).await.unwrap();
        assert_eq!(picked.email, "b@example.com");

        // The cooldown is per model: the other model still picks sticky.
        let picked = pool
            .pick_next("claude-sonnet-4-5", "sess", &[])
            .await
            .unwrap();
        assert_eq!(picked.email, "a@example.com");
    }

    #[tokio::test]
    async fn all_cooling_within_tolerance_returns_sticky() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp();
        let mut accounts = vec![account("a@example.com"), account("b@example.com")];
        for a in &mut accounts {
            a.rate_limits.insert(
                "gemini-3-pro".to_string(),
                RateLimitState {
                    cooldown_until: Some(now + 300),
                    last_429_at: Some(now - 10),
                    consecutive_429s: 1,
                },
            );
        }
        accounts[0].last_session_id = Some("sess".to_string());
        let pool = pool_with(dir.path(), accounts).await;

        let picked = pool.pick_next("gemini-3-pro", "sess", &[]).await.unwrap();
        assert_eq!(picked.email, "a@example.com");
    }

    #[tokio::test]
    async fn one_stale_cooldown_defeats_the_blip_tolerance() {
        // A fresh 429 on one account does not excuse another that has
        // been cooling for far longer than the tolerance window.
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp();
        let mut a = account("a@example.com");
        a.last_session_id = Some("sess".to_string());
        a.rate_limits.insert(
            "gemini-3-pro".to_string(),
            RateLimitState {
                cooldown_until: Some(now + 300),
                last_429_at: Some(now - 540),
                consecutive_429s: 4,
            },
        );
        let mut b = account("b@example.com");
        b.rate_limits.insert(
            "gemini-3-pro".to_string(),
            RateLimitState {
                cooldown_until: Some(now + 300),
                last_429_at: Some(now - 10),
                consecutive_429s: 1,
            },
        );
        let pool = pool_with(dir.path(), vec![a, b]).await;
        assert!(pool.pick_next("gemini-3-pro", "sess", &[]).await.is_none());
    }

    #[tokio::test]
    async fn all_cooling_past_tolerance_returns_none() {
        let dir = tempdir().unwrap();
        let now = Utc::now().timestamp();
        let mut a = account("a@example.com");
        a.rate_limits.insert(
            "gemini-3-pro".to_string(),
            RateLimitState {
                cooldown_until: Some(now + 300),
                last_429_at: Some(now - 600),
                consecutive_429s: 3,
            },
        );
        let pool = pool_with(dir.path(), vec![a]).await;
        assert!(pool.pick_next("gemini-3-pro", "sess", &[]).await.is_none());
    }

    #[tokio::test]
    async fn excluded_accounts_are_skipped() {
        let dir = tempdir().unwrap();
        let pool = pool_with(
            dir.path(),
            vec![account("a@example.com"), account("b@example.com")],
        )
        .await;
        let picked = pool
            .pick_next("gemini-3-pro", "sess", &["a@example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(picked.email, "b@example.com");
    }

    #[tokio::test]
    async fn rate_limit_advances_cooldown_and_backoff() {
        let dir = tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![account("a@example.com")]).await;

        pool.on_rate_limited("a@example.com", "gemini-3-pro", None)
            .await;
        let now = Utc::now().timestamp();
        let first_until = {
            let state = pool.inner.lock().await;
            let limits = &state.accounts[0].rate_limits["gemini-3-pro"];
            assert!(limits.cooldown_until.unwrap() > now);
            assert_eq!(limits.consecutive_429s, 1);
            limits.cooldown_until.unwrap()
        };

        pool.on_rate_limited("a@example.com", "gemini-3-pro", None)
            .await;
        {
            let state = pool.inner.lock().await;
            let limits = &state.accounts[0].rate_limits["gemini-3-pro"];
            assert_eq!(limits.consecutive_429s, 2);
            assert!(limits.cooldown_until.unwrap() > first_until);
        }
    }

    #[tokio::test]
    async fn parsed_reset_longer_than_base_wins() {
        let dir = tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![account("a@example.com")]).await;
        pool.on_rate_limited(
            "a@example.com",
            "gemini-3-pro",
            Some(Duration::from_secs(3600)),
        )
        .await;
        let state = pool.inner.lock().await;
        let until = state.accounts[0].rate_limits["gemini-3-pro"]
            .cooldown_until
            .unwrap();
        assert!(until >= Utc::now().timestamp() + 3500);
    }

    #[tokio::test]
    async fn success_clears_streak_and_binds_session() {
        let dir = tempdir().unwrap();
        let mut a = account("a@example.com");
        a.rate_limits.insert(
            "gemini-3-pro".to_string(),
            RateLimitState {
                cooldown_until: None,
                last_429_at: None,
                consecutive_429s: 4,
            },
        );
        let pool = pool_with(dir.path(), vec![a]).await;
        pool.on_success("a@example.com", "gemini-3-pro", "sess-9")
            .await;
        let state = pool.inner.lock().await;
        assert_eq!(
            state.accounts[0].last_session_id.as_deref(),
            Some("sess-9")
        );
        assert_eq!(
            state.accounts[0].rate_limits["gemini-3-pro"].consecutive_429s,
            0
        );
    }

    #[tokio::test]
    async fn fresh_token_skips_refresh() {
        let dir = tempdir().unwrap();
        let mut a = account("a@example.com");
        a.access_token = Some("tok".to_string());
        a.access_token_expiry = Some(Utc::now().timestamp() + 3600);
        let pool = pool_with(dir.path(), vec![a]).await;
        assert_eq!(pool.get_token("a@example.com").await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn disabled_account_token_is_an_auth_error() {
        let dir = tempdir().unwrap();
        let mut a = account("a@example.com");
        a.disabled = true;
        let pool = pool_with(dir.path(), vec![a]).await;
        assert!(matches!(
            pool.get_token("a@example.com").await,
            Err(GatewayError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn persistence_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let pool = pool_with(dir.path(), vec![account("a@example.com")]).await;
        pool.on_rate_limited("a@example.com", "gemini-3-pro", None)
            .await;

        let config = GatewayConfig::for_dir(dir.path());
        let reloaded = AccountPool::load(&config, reqwest::Client::new());
        let state = reloaded.inner.lock().await;
        assert_eq!(state.accounts.len(), 1);
        assert_eq!(
            state.accounts[0].rate_limits["gemini-3-pro"].consecutive_429s,
            1
        );
    }

    #[tokio::test]
    async fn truncated_accounts_file_starts_empty() {
        let dir = tempdir().unwrap();
        let config = GatewayConfig::for_dir(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(config.accounts_path(), "{\"accounts\": [{\"em").unwrap();
        let pool = AccountPool::load(&config, reqwest::Client::new());
        assert!(pool.is_empty().await);
    }
}
