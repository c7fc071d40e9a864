//! Shared Kubernetes utilities using kube-rs

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobCondition};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

const STATUS_TRUE: &str = "True";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from the in-cluster or local config with default timeouts
pub async fn create_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {e}"))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {e}"))
    })
}

/// True when the job has a condition of `condition_type` with status "True"
fn has_condition(conditions: Option<&[JobCondition]>, condition_type: &str) -> bool {
    conditions.is_some_and(|conds| {
        conds
            .iter()
            .any(|c| c.type_ == condition_type && c.status == STATUS_TRUE)
    })
}

/// What a job's status says about its progress
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    /// Created, no pod running yet
    Pending,
    /// A pod is active or ready
    Running,
    /// Finished successfully
    Complete {
        /// Completion time reported by the job controller
        completed: Option<DateTime<Utc>>,
    },
    /// Finished with a failure
    Failed {
        /// Reason and message of the Failed condition
        message: String,
    },
}

/// Classify a job from its conditions and pod counters
pub fn job_outcome(job: &Job) -> JobOutcome {
    let Some(status) = job.status.as_ref() else {
        return JobOutcome::Pending;
    };
    let conditions = status.conditions.as_deref();

    if has_condition(conditions, "Complete") {
        return JobOutcome::Complete {
            completed: status.completion_time.as_ref().map(|t| t.0),
        };
    }
    if has_condition(conditions, "Failed") {
        let message = conditions
            .and_then(|c| c.iter().find(|c| c.type_ == "Failed"))
            .map(|c| {
                let reason = c.reason.clone().unwrap_or_default();
                match c.message.as_deref() {
                    Some(m) if !m.is_empty() => format!("{reason}: {m}"),
                    _ => reason,
                }
            })
            .unwrap_or_default();
        return JobOutcome::Failed { message };
    }
    if status.ready == Some(1) || status.active == Some(1) {
        return JobOutcome::Running;
    }
    JobOutcome::Pending
}

/// Time of the job's latest transition to `Suspended=True`
pub fn suspended_since(job: &Job) -> Option<DateTime<Utc>> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .filter(|c| c.type_ == "Suspended" && c.status == STATUS_TRUE)
        .filter_map(|c| c.last_transition_time.as_ref().map(|t| t.0))
        .max()
}

/// Creation time of any object, `None` when the API server hasn't set it
pub fn creation_time(meta: &kube::api::ObjectMeta) -> Option<DateTime<Utc>> {
    meta.creation_timestamp.as_ref().map(|t| t.0)
}

/// Read a key of a secret as UTF-8
pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
}

/// Poll until a condition is met or timeout is reached
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Errors are retried until the timeout.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = std::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        if start.elapsed() > timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("polling condition not yet met"),
            Err(e) => trace!(error = %e, "polling check returned error, retrying"),
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Patch the status sub-resource of a namespaced resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Merge-patch the main resource (spec or metadata) of a namespaced resource
pub async fn merge_patch<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    patch: &serde_json::Value,
    field_manager: &str,
) -> std::result::Result<T, kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(patch))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn condition(type_: &str, status: &str) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn job(status: JobStatus) -> Job {
        Job {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_outcome_from_counters() {
        assert_eq!(job_outcome(&Job::default()), JobOutcome::Pending);
        assert_eq!(
            job_outcome(&job(JobStatus {
                active: Some(1),
                ..Default::default()
            })),
            JobOutcome::Running
        );
        assert_eq!(
            job_outcome(&job(JobStatus {
                ready: Some(1),
                ..Default::default()
            })),
            JobOutcome::Running
        );
    }

    #[test]
    fn test_job_outcome_from_conditions() {
        let mut failed = condition("Failed", "True");
        failed.reason = Some("BackoffLimitExceeded".to_string());
        failed.message = Some("Job has reached the specified backoff limit".to_string());
        assert_eq!(
            job_outcome(&job(JobStatus {
                conditions: Some(vec![failed]),
                ..Default::default()
            })),
            JobOutcome::Failed {
                message: "BackoffLimitExceeded: Job has reached the specified backoff limit"
                    .to_string()
            }
        );

        let now = Utc::now();
        assert_eq!(
            job_outcome(&job(JobStatus {
                conditions: Some(vec![condition("Complete", "True")]),
                completion_time: Some(Time(now)),
                ..Default::default()
            })),
            JobOutcome::Complete {
                completed: Some(now)
            }
        );
    }

    #[test]
    fn test_suspended_since_uses_latest_true_transition() {
        let earlier = Utc::now() - chrono::Duration::seconds(600);
        let later = Utc::now() - chrono::Duration::seconds(60);
        let mut a = condition("Suspended", "True");
        a.last_transition_time = Some(Time(earlier));
        let mut b = condition("Suspended", "True");
        b.last_transition_time = Some(Time(later));
        let mut c = condition("Suspended", "False");
        c.last_transition_time = Some(Time(Utc::now()));

        let j = job(JobStatus {
            conditions: Some(vec![a, b, c]),
            ..Default::default()
        });
        assert_eq!(suspended_since(&j), Some(later));
        assert_eq!(suspended_since(&Job::default()), None);
    }

    #[test]
    fn test_secret_string() {
        let secret = Secret {
            data: Some(
                [(
                    "AWS_ACCESS_KEY_ID".to_string(),
                    k8s_openapi::ByteString(b"key".to_vec()),
                )]
                .into(),
            ),
            ..Default::default()
        };
        assert_eq!(secret_string(&secret, "AWS_ACCESS_KEY_ID"), Some("key".to_string()));
        assert_eq!(secret_string(&secret, "missing"), None);
    }

    #[tokio::test]
    async fn test_poll_until_succeeds() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        poll_until(Duration::from_secs(1), Duration::from_millis(1), "timed out", || {
            let c = c.clone();
            async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let err = poll_until(Duration::from_millis(20), Duration::from_millis(5), "volumes remain", || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("volumes remain"));
    }
}
