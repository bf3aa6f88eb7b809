//! General-purpose named locks in `distributed_locks`, with expiry, renewal and owner checks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rawpull_core::Clock;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

const LOCK_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {0} not found")]
    NotFound(String),
    #[error("lock {key} is held by {owner}")]
    AlreadyHeld { key: String, owner: String },
    #[error("lock {0} has expired")]
    Expired(String),
    #[error("lock {key} is not owned by {owner}")]
    NotOwner { key: String, owner: String },
    #[error("gave up on lock {key} after {attempts} attempts")]
    Timeout { key: String, attempts: usize },
    #[error("lock ttl must be positive")]
    InvalidTtl,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: String,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Takes the lock if it is free or expired. Returns `false` when someone else holds it.
    async fn try_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError>;

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), LockError>;

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), LockError>;

    async fn lookup(&self, key: &str) -> Result<Option<LockInfo>, LockError>;

    async fn clean_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError>;

    /// Polls [`Locker::try_lock`] every 100ms, up to `max_attempts` times.
    async fn lock(
        &self,
        clock: &dyn Clock,
        key: &str,
        owner: &str,
        ttl: Duration,
        max_attempts: usize,
    ) -> Result<(), LockError> {
        let attempts = max_attempts.max(1);
        for attempt in 0..attempts {
            if self.try_lock(key, owner, ttl, clock.now()).await? {
                return Ok(());
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
        }
        Err(LockError::Timeout {
            key: key.to_string(),
            attempts,
        })
    }

    async fn is_locked(&self, key: &str, now: DateTime<Utc>) -> Result<bool, LockError> {
        Ok(self
            .lookup(key)
            .await?
            .is_some_and(|info| info.expires_at > now))
    }

    async fn owner_of(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, LockError> {
        Ok(self
            .lookup(key)
            .await?
            .filter(|info| info.expires_at > now)
            .map(|info| info.owner_id))
    }
}

fn check_ttl(ttl: Duration) -> Result<(), LockError> {
    if ttl <= Duration::zero() {
        return Err(LockError::InvalidTtl);
    }
    Ok(())
}

fn renew_failure(key: &str, owner: &str, info: Option<LockInfo>, now: DateTime<Utc>) -> LockError {
    match info {
        None => LockError::NotFound(key.to_string()),
        Some(info) if info.owner_id != owner => LockError::NotOwner {
            key: key.to_string(),
            owner: owner.to_string(),
        },
        Some(info) if info.expires_at <= now => LockError::Expired(key.to_string()),
        Some(info) => LockError::AlreadyHeld {
            key: key.to_string(),
            owner: info.owner_id,
        },
    }
}

#[derive(Debug, Clone)]
pub struct PgLocker {
    pool: PgPool,
}

impl PgLocker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Locker for PgLocker {
    async fn try_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        check_ttl(ttl)?;
        let result = sqlx::query(
            r#"
            INSERT INTO distributed_locks (lock_key, owner_id, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (lock_key) DO UPDATE
               SET owner_id = EXCLUDED.owner_id,
                   expires_at = EXCLUDED.expires_at,
                   updated_at = EXCLUDED.updated_at
             WHERE distributed_locks.expires_at <= $4
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        check_ttl(ttl)?;
        let result = sqlx::query(
            r#"
            UPDATE distributed_locks
               SET expires_at = $3, updated_at = $4
             WHERE lock_key = $1 AND owner_id = $2 AND expires_at > $4
            "#,
        )
        .bind(key)
        .bind(owner)
        .bind(now + ttl)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(renew_failure(key, owner, self.lookup(key).await?, now));
        }
        Ok(())
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE lock_key = $1 AND owner_id = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return match self.lookup(key).await? {
                None => Err(LockError::NotFound(key.to_string())),
                Some(_) => Err(LockError::NotOwner {
                    key: key.to_string(),
                    owner: owner.to_string(),
                }),
            };
        }
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        let row = sqlx::query(
            "SELECT lock_key, owner_id, expires_at FROM distributed_locks WHERE lock_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(LockInfo {
                key: row.try_get("lock_key")?,
                owner_id: row.try_get("owner_id")?,
                expires_at: row.try_get("expires_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn clean_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLocker {
    locks: Mutex<HashMap<String, LockInfo>>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn try_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        check_ttl(ttl)?;
        let mut locks = self.locks.lock().await;
        if let Some(existing) = locks.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            LockInfo {
                key: key.to_string(),
                owner_id: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), LockError> {
        check_ttl(ttl)?;
        let mut locks = self.locks.lock().await;
        match locks.get_mut(key) {
            Some(info) if info.owner_id == owner && info.expires_at > now => {
                info.expires_at = now + ttl;
                Ok(())
            }
            other => Err(renew_failure(key, owner, other.cloned(), now)),
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            None => Err(LockError::NotFound(key.to_string())),
            Some(info) if info.owner_id != owner => Err(LockError::NotOwner {
                key: key.to_string(),
                owner: owner.to_string(),
            }),
            Some(_) => {
                locks.remove(key);
                Ok(())
            }
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        Ok(self.locks.lock().await.get(key).cloned())
    }

    async fn clean_expired(&self, now: DateTime<Utc>) -> Result<u64, LockError> {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, info| info.expires_at > now);
        Ok((before - locks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rawpull_core::FixedClock;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn second_owner_is_refused_until_expiry() {
        let locker = MemoryLocker::new();
        assert!(locker.try_lock("k", "a", Duration::seconds(30), t0()).await.unwrap());
        assert!(!locker.try_lock("k", "b", Duration::seconds(30), t0()).await.unwrap());
        assert_eq!(locker.owner_of("k", t0()).await.unwrap().as_deref(), Some("a"));

        let later = t0() + Duration::seconds(31);
        assert!(!locker.is_locked("k", later).await.unwrap());
        assert!(locker.try_lock("k", "b", Duration::seconds(30), later).await.unwrap());
        assert_eq!(locker.owner_of("k", later).await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn renew_distinguishes_failure_modes() {
        let locker = MemoryLocker::new();
        let ttl = Duration::seconds(10);
        assert!(matches!(
            locker.renew("k", "a", ttl, t0()).await,
            Err(LockError::NotFound(_))
        ));

        locker.try_lock("k", "a", ttl, t0()).await.unwrap();
        assert!(matches!(
            locker.renew("k", "b", ttl, t0()).await,
            Err(LockError::NotOwner { .. })
        ));
        locker.renew("k", "a", ttl, t0() + Duration::seconds(5)).await.unwrap();
        assert!(locker.is_locked("k", t0() + Duration::seconds(14)).await.unwrap());
        assert!(matches!(
            locker.renew("k", "a", ttl, t0() + Duration::seconds(60)).await,
            Err(LockError::Expired(_))
        ));
    }

    #[tokio::test]
    async fn unlock_checks_owner() {
        let locker = MemoryLocker::new();
        locker.try_lock("k", "a", Duration::seconds(10), t0()).await.unwrap();
        assert!(matches!(
            locker.unlock("k", "b").await,
            Err(LockError::NotOwner { .. })
        ));
        locker.unlock("k", "a").await.unwrap();
        assert!(matches!(locker.unlock("k", "a").await, Err(LockError::NotFound(_))));
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let locker = MemoryLocker::new();
        assert!(matches!(
            locker.try_lock("k", "a", Duration::zero(), t0()).await,
            Err(LockError::InvalidTtl)
        ));
    }

    #[tokio::test]
    async fn clean_expired_removes_only_stale_rows() {
        let locker = MemoryLocker::new();
        locker.try_lock("old", "a", Duration::seconds(1), t0()).await.unwrap();
        locker.try_lock("new", "a", Duration::seconds(100), t0()).await.unwrap();
        let removed = locker.clean_expired(t0() + Duration::seconds(5)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(locker.lookup("old").await.unwrap().is_none());
        assert!(locker.lookup("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blocking_lock_gives_up_after_attempts() {
        let locker = MemoryLocker::new();
        let clock = FixedClock::new(t0());
        locker.try_lock("k", "a", Duration::hours(1), t0()).await.unwrap();
        let err = locker
            .lock(&clock, "k", "b", Duration::hours(1), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { attempts: 2, .. }));
        locker.lock(&clock, "free", "b", Duration::hours(1), 1).await.unwrap();
    }
}
