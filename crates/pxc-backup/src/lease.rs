//! Per-cluster backup lock on a coordination.k8s.io/v1 Lease
//!
//! Backups of a cluster that disallows parallel runs take turns through a
//! single Lease named after the cluster. The holder identity is
//! `<backup-name>-<backup-uid>`, so a recreated backup with the same name is a
//! different holder. The holder never changes in place: the lease is deleted
//! by its holder and created again by the next backup. Deletes carry the uid
//! and resourceVersion that were read, so a release never removes a lease
//! that changed hands in between.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::Preconditions;
use thiserror::Error;
use tracing::{debug, info};

use pxc_common::naming::backup_lease_name;

use crate::client::KubeClient;

/// Lease errors
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Release was requested by someone other than the current holder
    #[error("not the holder")]
    NotTheHolder {
        /// Current holder identity
        holder: String,
    },

    /// Kubernetes API error
    #[error(transparent)]
    Kube(#[from] pxc_common::Error),
}

/// Holder identity recorded on a lease
pub fn holder_of(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref()?.holder_identity.as_deref()
}

/// Get the cluster's backup lease, creating it for `holder` when absent.
///
/// The returned lease may name a different holder; callers compare it with
/// their own identity. An existing lease is never modified.
pub async fn acquire(
    kube: &dyn KubeClient,
    namespace: &str,
    cluster: &str,
    holder: &str,
) -> Result<Lease, LeaseError> {
    let name = backup_lease_name(cluster);

    if let Some(existing) = kube.get_lease(&name, namespace).await? {
        return Ok(existing);
    }

    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder.to_string()),
            acquire_time: Some(MicroTime(Utc::now())),
            ..Default::default()
        }),
    };

    match kube.create_lease(namespace, &lease).await {
        Ok(created) => {
            info!(lease = %name, holder, "acquired backup lease");
            Ok(created)
        }
        Err(e) if e.is_conflict() => {
            // Lost the race to another backup, report whoever won
            debug!(lease = %name, holder, "backup lease created concurrently");
            kube.get_lease(&name, namespace)
                .await?
                .ok_or_else(|| LeaseError::Kube(e))
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete the cluster's backup lease if `holder` holds it.
///
/// A missing lease counts as released.
pub async fn release(
    kube: &dyn KubeClient,
    namespace: &str,
    cluster: &str,
    holder: &str,
) -> Result<(), LeaseError> {
    let name = backup_lease_name(cluster);

    let Some(lease) = kube.get_lease(&name, namespace).await? else {
        debug!(lease = %name, "backup lease not found, nothing to release");
        return Ok(());
    };

    check_holder(&lease, holder)?;

    let preconditions = Preconditions {
        uid: lease.metadata.uid.clone(),
        resource_version: lease.metadata.resource_version.clone(),
    };
    match kube.delete_lease(&name, namespace, preconditions).await {
        Ok(()) => {
            info!(lease = %name, holder, "released backup lease");
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            // Changed since the read
            match kube.get_lease(&name, namespace).await? {
                None => Ok(()),
                Some(current) => {
                    check_holder(&current, holder)?;
                    Err(e.into())
                }
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn check_holder(lease: &Lease, holder: &str) -> Result<(), LeaseError> {
    match holder_of(lease) {
        Some(current) if current == holder => Ok(()),
        current => Err(LeaseError::NotTheHolder {
            holder: current.unwrap_or_default().to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub(crate) fn conflict() -> pxc_common::Error {
        pxc_common::Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }))
    }

    fn lease_held_by(holder: &str, uid: &str, resource_version: &str) -> Lease {
        Lease {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                ..Default::default()
            }),
        }
    }

    /// Mock whose lease calls behave like the API server on a single object
    fn lease_server(store: Arc<Mutex<Option<Lease>>>) -> MockKubeClient {
        let mut mock = MockKubeClient::new();
        let version = Arc::new(Mutex::new(0u32));

        let s = store.clone();
        mock.expect_get_lease()
            .returning(move |_, _| Ok(s.lock().clone()));

        let s = store.clone();
        mock.expect_create_lease().returning(move |_, lease| {
            let mut current = s.lock();
            if current.is_some() {
                return Err(conflict());
            }
            let n = {
                let mut v = version.lock();
                *v += 1;
                *v
            };
            let mut created = lease.clone();
            created.metadata.uid = Some(format!("uid-{n}"));
            created.metadata.resource_version = Some(n.to_string());
            *current = Some(created.clone());
            Ok(created)
        });

        let s = store;
        mock.expect_delete_lease()
            .returning(move |_, _, preconditions| {
                let mut current = s.lock();
                let matches = current.as_ref().is_some_and(|l| {
                    l.metadata.uid == preconditions.uid
                        && l.metadata.resource_version == preconditions.resource_version
                });
                if !matches {
                    return Err(conflict());
                }
                *current = None;
                Ok(())
            });

        mock
    }

    /// Story: two backups of the same cluster race for the lock; the first
    /// one holds it and the second sees the first as holder without touching
    /// the lease
    #[tokio::test]
    async fn story_single_holder() {
        let store = Arc::new(Mutex::new(None));
        let mock = lease_server(store.clone());

        let lease = acquire(&mock, "ns", "cluster1", "backup1-uid1").await.unwrap();
        assert_eq!(holder_of(&lease), Some("backup1-uid1"));
        let acquired_at = lease.spec.as_ref().unwrap().acquire_time.clone();

        let lease = acquire(&mock, "ns", "cluster1", "backup2-uid2").await.unwrap();
        assert_eq!(holder_of(&lease), Some("backup1-uid1"));

        let stored = store.lock().clone().unwrap();
        assert_eq!(holder_of(&stored), Some("backup1-uid1"));
        assert_eq!(stored.spec.unwrap().acquire_time, acquired_at);
        assert_eq!(stored.metadata.name.as_deref(), Some("pxc-cluster1-backup-lock"));
    }

    /// Story: a backup that doesn't hold the lock can't release it
    #[tokio::test]
    async fn story_non_holder_release_is_rejected() {
        let store = Arc::new(Mutex::new(None));
        let mock = lease_server(store.clone());

        acquire(&mock, "ns", "cluster1", "backup1-uid1").await.unwrap();

        let err = release(&mock, "ns", "cluster1", "backup2-uid2")
            .await
            .unwrap_err();
        assert!(matches!(&err, LeaseError::NotTheHolder { holder } if holder == "backup1-uid1"));
        assert_eq!(err.to_string(), "not the holder");
        assert!(store.lock().is_some());

        release(&mock, "ns", "cluster1", "backup1-uid1").await.unwrap();
        assert!(store.lock().is_none());

        // Next backup can take over once the lease is gone
        let lease = acquire(&mock, "ns", "cluster1", "backup2-uid2").await.unwrap();
        assert_eq!(holder_of(&lease), Some("backup2-uid2"));
    }

    #[tokio::test]
    async fn test_release_of_missing_lease_succeeds() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_lease().returning(|_, _| Ok(None));
        mock.expect_delete_lease().never();

        release(&mock, "ns", "cluster1", "backup1-uid1").await.unwrap();
    }

    /// Story: the lease was released and taken by the next backup between our
    /// read and our delete; the delete is refused and the new holder keeps
    /// its lock
    #[tokio::test]
    async fn story_stale_release_keeps_next_holder_lease() {
        let mut mock = MockKubeClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_get_lease()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(lease_held_by("backup1-uid1", "uid-a", "7"))));
        mock.expect_delete_lease()
            .withf(|name, _, p| {
                name == "pxc-cluster1-backup-lock"
                    && p.uid.as_deref() == Some("uid-a")
                    && p.resource_version.as_deref() == Some("7")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Err(conflict()));
        mock.expect_get_lease()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(lease_held_by("backup2-uid2", "uid-b", "9"))));

        let err = release(&mock, "ns", "cluster1", "backup1-uid1")
            .await
            .unwrap_err();
        assert!(matches!(&err, LeaseError::NotTheHolder { holder } if holder == "backup2-uid2"));
    }

    #[tokio::test]
    async fn test_release_conflict_on_own_lease_is_retried_later() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_lease()
            .times(2)
            .returning(|_, _| Ok(Some(lease_held_by("backup1-uid1", "uid-a", "7"))));
        mock.expect_delete_lease()
            .times(1)
            .returning(|_, _, _| Err(conflict()));

        let err = release(&mock, "ns", "cluster1", "backup1-uid1")
            .await
            .unwrap_err();
        assert!(matches!(&err, LeaseError::Kube(e) if e.is_conflict()));
    }

    /// Story: when another backup creates the lease between our read and our
    /// create, we report the winner instead of failing
    #[tokio::test]
    async fn story_lost_create_race_reports_winner() {
        let winner = Lease {
            spec: Some(LeaseSpec {
                holder_identity: Some("backup1-uid1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut mock = MockKubeClient::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_get_lease()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(None));
        mock.expect_create_lease()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(conflict()));
        mock.expect_get_lease()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(Some(winner.clone())));

        let lease = acquire(&mock, "ns", "cluster1", "backup2-uid2").await.unwrap();
        assert_eq!(holder_of(&lease), Some("backup1-uid1"));
    }
}
