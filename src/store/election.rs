//! Lease-based leader election. One replica of the controller set holds the
//! lease and runs the control loops; the allocation engine and admission
//! webhooks serve on every replica.

use super::{update_with_retry, Store};
use crate::resources::{Lease, Metadata, ObjectKey, Resource};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Namespace the lock lives in.
pub const LOCK_NAMESPACE: &str = "fleetforge-system";
/// Name of the lock lease.
pub const LOCK_NAME: &str = "fleetforge-controller-lock";

/// Election failures. Losing a held lease is fatal for the process.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// The lease was taken over by another candidate while we held it.
    #[error("leader lease lost to {holder}")]
    LeaseLost {
        /// Identity now holding the lease.
        holder: String,
    },
    /// The store rejected a lease write.
    #[error("lease write failed: {0}")]
    Store(#[from] super::StoreError),
}

/// Campaigns for and renews the controller lease.
pub struct Elector {
    store: Arc<Store>,
    identity: String,
    lease_duration: Duration,
}

impl Elector {
    /// Build an elector for this process identity.
    pub fn new(store: Arc<Store>, identity: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            store,
            identity: identity.into(),
            lease_duration,
        }
    }

    fn lock_key() -> ObjectKey {
        ObjectKey::new(LOCK_NAMESPACE, LOCK_NAME)
    }

    /// Block until this process holds the lease.
    pub async fn acquire(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ElectionError> {
        let retry = self.lease_duration / 3;
        loop {
            if self.try_acquire()? {
                info!(identity = %self.identity, "acquired leader lease");
                return Ok(());
            }
            debug!(identity = %self.identity, "lease held elsewhere, retrying");
            tokio::select! {
                _ = tokio::time::sleep(retry) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn try_acquire(&self) -> Result<bool, ElectionError> {
        let key = Self::lock_key();
        let now = Utc::now();
        match self.store.leases.get(&key) {
            Err(e) if e.is_not_found() => {
                let lease = Lease {
                    metadata: Metadata::named(LOCK_NAMESPACE, LOCK_NAME),
                    holder_identity: self.identity.clone(),
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    lease_duration_seconds: self.lease_duration.as_secs(),
                };
                match self.store.leases.create(lease) {
                    Ok(_) => Ok(true),
                    // Somebody else created it between our get and create.
                    Err(e) if matches!(e, super::StoreError::AlreadyExists { .. }) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
            Ok(lease) => {
                if lease.holder_identity == self.identity {
                    return Ok(true);
                }
                let expired = lease
                    .renew_time
                    .map(|t| {
                        now - t > ChronoDuration::seconds(lease.lease_duration_seconds as i64)
                    })
                    .unwrap_or(true);
                if !expired {
                    return Ok(false);
                }
                warn!(
                    previous = %lease.holder_identity,
                    "taking over expired leader lease"
                );
                let identity = self.identity.clone();
                let taken = update_with_retry(&self.store.leases, &key, |l| {
                    l.holder_identity = identity.clone();
                    l.acquire_time = Some(now);
                    l.renew_time = Some(now);
                    true
                });
                match taken {
                    Ok(l) => Ok(l.holder_identity == self.identity),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Renew the held lease until shutdown; resolves with an error if the
    /// lease is lost, which callers treat as fatal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ElectionError> {
        let key = Self::lock_key();
        let renew_every = self.lease_duration / 3;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(renew_every) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
            let lease = self.store.leases.get(&key)?;
            if lease.holder_identity != self.identity {
                return Err(ElectionError::LeaseLost {
                    holder: lease.holder_identity,
                });
            }
            update_with_retry(&self.store.leases, &key, |l| {
                l.renew_time = Some(Utc::now());
                true
            })?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_candidate_waits_for_expiry() {
        let store = Store::new();
        let (_tx, shutdown) = watch::channel(false);

        let first = Elector::new(store.clone(), "alpha", Duration::from_secs(2));
        first.acquire(shutdown.clone()).await.unwrap();

        let second = Elector::new(store.clone(), "beta", Duration::from_secs(2));
        assert!(!second.try_acquire().unwrap());

        // Expire the lease and the second candidate takes over.
        update_with_retry(&store.leases, &Elector::lock_key(), |l| {
            l.renew_time = Some(Utc::now() - ChronoDuration::seconds(120));
            true
        })
        .unwrap();
        assert!(second.try_acquire().unwrap());

        // The first candidate now observes the loss on renewal.
        let err = first.run(shutdown).await.unwrap_err();
        assert!(matches!(err, ElectionError::LeaseLost { .. }));
    }
}
