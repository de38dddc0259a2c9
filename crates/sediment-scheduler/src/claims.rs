//! In-memory claim store.
//!
//! Shared by every scheduler instance in one process. A claim is leased while
//! its holder creates the job and becomes permanent once committed, so
//! duplicate or replayed commit events never create a second job for the same
//! input set. Jobs carry a separate execution lease that their executor renews;
//! a job whose lease lapsed is picked up by another instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sediment_core::ids::{JobId, PipelineId};
use sediment_core::ports::{ClaimKey, ClaimStore, Reservation};
use sediment_core::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
enum Claim {
    Leased {
        owner: String,
        expires_at: DateTime<Utc>,
    },
    Committed {
        owner: String,
        job_id: JobId,
    },
}

#[derive(Debug, Clone)]
struct ExecutionLease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryClaimStore {
    claims: RwLock<HashMap<ClaimKey, Claim>>,
    executors: RwLock<HashMap<JobId, ExecutionLease>>,
}

fn expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::seconds(30))
}

impl MemoryClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live or committed claims.
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.claims
            .read()
            .await
            .values()
            .filter(|c| match c {
                Claim::Leased { expires_at, .. } => *expires_at > now,
                Claim::Committed { .. } => true,
            })
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn reserve(&self, key: &ClaimKey, owner: &str, lease: Duration) -> Result<Reservation> {
        let mut claims = self.claims.write().await;
        let now = Utc::now();

        match claims.get(key) {
            Some(Claim::Committed { job_id, .. }) => {
                return Ok(Reservation::Committed { job_id: *job_id });
            }
            Some(Claim::Leased {
                owner: holder,
                expires_at,
            }) if *expires_at > now => {
                return Ok(Reservation::Held {
                    owner: holder.clone(),
                });
            }
            // Absent or expired
            _ => {}
        }

        let expires_at = expiry(now, lease);
        claims.insert(
            key.clone(),
            Claim::Leased {
                owner: owner.to_string(),
                expires_at,
            },
        );
        debug!(key = %key, owner, "Reserved claim");
        Ok(Reservation::Acquired)
    }

    async fn commit(&self, key: &ClaimKey, owner: &str, job_id: JobId) -> Result<()> {
        let mut claims = self.claims.write().await;
        match claims.get(key) {
            Some(Claim::Leased { owner: holder, .. }) if holder == owner => {}
            Some(Claim::Committed {
                owner: holder,
                job_id: existing,
            }) if holder == owner && *existing == job_id => return Ok(()),
            Some(_) => {
                return Err(Error::Claim(format!(
                    "claim {} is not held by {}",
                    key, owner
                )));
            }
            None => {
                return Err(Error::Claim(format!("claim {} was never reserved", key)));
            }
        }
        claims.insert(
            key.clone(),
            Claim::Committed {
                owner: owner.to_string(),
                job_id,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &ClaimKey, owner: &str) -> Result<()> {
        let mut claims = self.claims.write().await;
        if let Some(Claim::Leased { owner: holder, .. }) = claims.get(key)
            && holder == owner
        {
            claims.remove(key);
        }
        Ok(())
    }

    async fn release_pipeline(&self, pipeline_id: PipelineId) -> Result<usize> {
        let mut claims = self.claims.write().await;
        let before = claims.len();
        claims.retain(|key, _| key.pipeline_id != pipeline_id);
        Ok(before - claims.len())
    }

    async fn lease_job(&self, job_id: JobId, owner: &str, lease: Duration) -> Result<bool> {
        let mut executors = self.executors.write().await;
        let now = Utc::now();
        if let Some(current) = executors.get(&job_id)
            && current.owner != owner
            && current.expires_at > now
        {
            return Ok(false);
        }
        executors.insert(
            job_id,
            ExecutionLease {
                owner: owner.to_string(),
                expires_at: expiry(now, lease),
            },
        );
        Ok(true)
    }

    async fn release_job(&self, job_id: JobId, owner: &str) -> Result<()> {
        let mut executors = self.executors.write().await;
        if executors.get(&job_id).is_some_and(|l| l.owner == owner) {
            executors.remove(&job_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sediment_core::ids::CommitId;

    fn key() -> ClaimKey {
        ClaimKey::new(PipelineId::new(), 1, vec![CommitId::new(), CommitId::new()])
    }

    #[tokio::test]
    async fn test_second_owner_is_held_off() {
        let store = MemoryClaimStore::new();
        let k = key();
        let lease = Duration::from_secs(30);
        assert_eq!(store.reserve(&k, "a", lease).await.unwrap(), Reservation::Acquired);
        assert_eq!(
            store.reserve(&k, "b", lease).await.unwrap(),
            Reservation::Held { owner: "a".into() }
        );
        // A live lease also holds off its own owner's concurrent triggers
        assert_eq!(
            store.reserve(&k, "a", lease).await.unwrap(),
            Reservation::Held { owner: "a".into() }
        );

        let job = JobId::new();
        store.commit(&k, "a", job).await.unwrap();
        assert_eq!(
            store.reserve(&k, "b", lease).await.unwrap(),
            Reservation::Committed { job_id: job }
        );
        assert_eq!(
            store.reserve(&k, "a", lease).await.unwrap(),
            Reservation::Committed { job_id: job }
        );
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let store = MemoryClaimStore::new();
        let k = key();
        store.reserve(&k, "a", Duration::ZERO).await.unwrap();
        assert_eq!(
            store.reserve(&k, "b", Duration::from_secs(30)).await.unwrap(),
            Reservation::Acquired
        );
        assert!(store.commit(&k, "a", JobId::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_job_lease_is_exclusive_until_it_lapses() {
        let store = MemoryClaimStore::new();
        let job = JobId::new();
        let lease = Duration::from_secs(30);
        assert!(store.lease_job(job, "a", lease).await.unwrap());
        assert!(!store.lease_job(job, "b", lease).await.unwrap());
        // Renewal by the holder
        assert!(store.lease_job(job, "a", lease).await.unwrap());

        store.release_job(job, "b").await.unwrap();
        assert!(!store.lease_job(job, "b", lease).await.unwrap());
        store.release_job(job, "a").await.unwrap();
        assert!(store.lease_job(job, "b", Duration::ZERO).await.unwrap());
        assert!(store.lease_job(job, "a", lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_release() {
        let store = MemoryClaimStore::new();
        let k = key();
        store.reserve(&k, "a", Duration::from_secs(30)).await.unwrap();
        store.release(&k, "b").await.unwrap();
        assert_eq!(store.len().await, 1);
        store.release(&k, "a").await.unwrap();
        assert!(store.is_empty().await);

        store.reserve(&k, "a", Duration::from_secs(30)).await.unwrap();
        store.commit(&k, "a", JobId::new()).await.unwrap();
        assert_eq!(store.release_pipeline(k.pipeline_id).await.unwrap(), 1);
        assert_eq!(
            store.reserve(&k, "b", Duration::from_secs(30)).await.unwrap(),
            Reservation::Acquired
        );
    }
}
