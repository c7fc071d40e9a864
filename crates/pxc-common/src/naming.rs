//! Deterministic names, labels and well-known paths
//!
//! Every resource the controllers create is named from its owner so that a
//! reconcile after a restart finds the same objects again.

use std::collections::BTreeMap;

/// Finalizer that removes a backup's objects from storage on deletion
pub const FINALIZER_DELETE_BACKUP: &str = "percona.com/delete-backup";

/// Finalizer that releases the cluster backup lease on deletion
pub const FINALIZER_RELEASE_LOCK: &str = "internal.percona.com/release-lock";

/// Finalizer that keeps a restore job around until its restore is terminal
pub const FINALIZER_KEEP_JOB: &str = "internal.percona.com/keep-job";

/// Maximum length of a DNS-1035 label (job names end up in pod labels)
pub const DNS_LABEL_MAX_LENGTH: usize = 63;

/// Suffix of the marker object written next to a backup that cannot serve PITR
pub const PITR_NOT_READY: &str = "pitr-not-ready";

/// Marker file written by the binlog collector when a gap is detected
pub const GAP_DETECTED_PATH: &str = "/tmp/gap-detected";

/// File holding the first and last uploaded binlog timestamps
pub const TIMELINE_PATH: &str = "/tmp/pitr-timeline";

/// Directory where the storage CA bundle is mounted
pub const STORAGE_CA_DIRECTORY: &str = "/etc/s3/certs";

/// File name of the storage CA bundle
pub const STORAGE_CA_FILE: &str = "ca.crt";

/// Container name of the binlog collector
pub const PITR_CONTAINER: &str = "pitr";

/// Label keys
pub mod labels {
    /// app.kubernetes.io/name
    pub const NAME: &str = "app.kubernetes.io/name";
    /// app.kubernetes.io/instance
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    /// app.kubernetes.io/component
    pub const COMPONENT: &str = "app.kubernetes.io/component";
    /// app.kubernetes.io/managed-by
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// app.kubernetes.io/part-of
    pub const PART_OF: &str = "app.kubernetes.io/part-of";
    /// percona.com/cluster
    pub const CLUSTER: &str = "percona.com/cluster";
    /// percona.com/backup-name
    pub const BACKUP_NAME: &str = "percona.com/backup-name";
    /// percona.com/backup-job-name
    pub const BACKUP_JOB_NAME: &str = "percona.com/backup-job-name";
    /// percona.com/restore-svc-name
    pub const RESTORE_SERVICE_NAME: &str = "percona.com/restore-svc-name";
    /// percona.com/restore-job-name
    pub const RESTORE_JOB_NAME: &str = "percona.com/restore-job-name";
}

/// Name of the lease guarding exclusive backups of a cluster
pub fn backup_lease_name(cluster: &str) -> String {
    format!("pxc-{cluster}-backup-lock")
}

/// Identity a backup uses when holding the cluster lease
pub fn backup_holder_id(backup_name: &str, backup_uid: &str) -> String {
    format!("{backup_name}-{backup_uid}")
}

/// Name of the job (and PVC) created for a backup
pub fn backup_job_name(backup_name: &str) -> String {
    trim_job_name(&format!("xb-{backup_name}"))
}

/// Name of the job that restores the base backup
pub fn restore_job_name(restore: &str, cluster: &str) -> String {
    trim_job_name(&format!("restore-job-{restore}-{cluster}"))
}

/// Name of the job that replays binlogs on top of a restored backup
pub fn pitr_job_name(restore: &str, cluster: &str) -> String {
    trim_job_name(&format!("pitr-job-{restore}-{cluster}"))
}

/// Name of the job that finalizes files left by the restore job
pub fn prepare_job_name(restore: &str, cluster: &str) -> String {
    trim_job_name(&format!("prepare-job-{restore}-{cluster}"))
}

/// Name of the transient pod and service serving a PVC backup to the restore job
pub fn restore_source_name(restore: &str, pvc: &str) -> String {
    trim_job_name(&format!("restore-src-{restore}-{pvc}"))
}

/// Name of the short-lived secret created for a PITR-enabled backup
pub fn pitr_bootstrap_secret_name(backup_name: &str) -> String {
    format!("{backup_name}-pitr-bootstrap")
}

/// Name of the secret holding the cluster's system user passwords
pub fn internal_secret_name(cluster: &str) -> String {
    format!("internal-{cluster}")
}

/// Prefix of the data volume claims of the PXC statefulset
pub fn pxc_data_volume_prefix(cluster: &str) -> String {
    format!("datadir-{cluster}-pxc-")
}

/// Prefix of the hostnames of the PXC pods, as reported by the peer list
pub fn pxc_host_prefix(cluster: &str) -> String {
    format!("{cluster}-pxc-")
}

/// Trim a name to a legal job name.
///
/// Job names are copied into the `batch.kubernetes.io/job-name` pod label,
/// so they must fit in 63 characters and start and end alphanumeric.
pub fn trim_job_name(name: &str) -> String {
    fn is_alnum(c: char) -> bool {
        c.is_ascii_lowercase() || c.is_ascii_digit()
    }

    let mut trimmed = name
        .trim_start_matches(|c: char| !is_alnum(c))
        .trim_end_matches(|c: char| !is_alnum(c))
        .to_string();

    if trimmed.len() > DNS_LABEL_MAX_LENGTH {
        trimmed.truncate(DNS_LABEL_MAX_LENGTH);
        trimmed = trimmed.trim_end_matches(|c: char| !is_alnum(c)).to_string();
    }

    trimmed
}

fn component_labels(cluster: &str, component: &str) -> BTreeMap<String, String> {
    let mut l = cluster_labels(cluster);
    l.insert(labels::COMPONENT.to_string(), component.to_string());
    l
}

/// Labels shared by every resource belonging to a cluster
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::NAME.to_string(), "percona-xtradb-cluster".to_string()),
        (labels::PART_OF.to_string(), "percona-xtradb-cluster".to_string()),
        (labels::INSTANCE.to_string(), cluster.to_string()),
        (
            labels::MANAGED_BY.to_string(),
            "percona-xtradb-cluster-operator".to_string(),
        ),
    ])
}

/// Selector for the PXC pods of a cluster
pub fn pxc_labels(cluster: &str) -> BTreeMap<String, String> {
    component_labels(cluster, "pxc")
}

/// Selector for the HAProxy pods of a cluster
pub fn haproxy_labels(cluster: &str) -> BTreeMap<String, String> {
    component_labels(cluster, "haproxy")
}

/// Selector for the ProxySQL pods of a cluster
pub fn proxysql_labels(cluster: &str) -> BTreeMap<String, String> {
    component_labels(cluster, "proxysql")
}

/// Selector for the binlog collector pod of a cluster
pub fn pitr_labels(cluster: &str) -> BTreeMap<String, String> {
    component_labels(cluster, "pitr")
}

/// Labels of a backup job and its pod
pub fn backup_job_labels(cluster: &str, backup: &str, job: &str) -> BTreeMap<String, String> {
    let mut l = component_labels(cluster, "backup");
    l.insert(labels::CLUSTER.to_string(), cluster.to_string());
    l.insert(labels::BACKUP_NAME.to_string(), backup.to_string());
    l.insert(labels::BACKUP_JOB_NAME.to_string(), job.to_string());
    l
}

/// Labels of a restore job and its pod
pub fn restore_job_labels(cluster: &str, job: &str) -> BTreeMap<String, String> {
    let mut l = component_labels(cluster, "restore");
    l.insert(labels::CLUSTER.to_string(), cluster.to_string());
    l.insert(labels::RESTORE_JOB_NAME.to_string(), job.to_string());
    l
}

/// Labels of the transient PVC restore source pod and service
pub fn restore_source_labels(cluster: &str, service: &str) -> BTreeMap<String, String> {
    let mut l = component_labels(cluster, "restore-src");
    l.insert(labels::RESTORE_SERVICE_NAME.to_string(), service.to_string());
    l
}

/// Render a label map as a Kubernetes label selector string
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
