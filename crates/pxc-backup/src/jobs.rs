//! Builders for the jobs, pods and claims backups and restores run on
//!
//! The specs are minimal: image, command, environment and volumes. What the
//! containers do is up to the backup image; the builders only decide what
//! they are pointed at.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, KeyToPath, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec,
    SecretKeySelector, SecretVolumeSource, Service, ServicePort, ServiceSpec, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use pxc_common::crd::{
    BackupStorageSpec, BackupStorageType, PerconaXtraDBCluster, PerconaXtraDBClusterBackup,
    PerconaXtraDBClusterBackupStatus, PerconaXtraDBClusterRestore, PitrType, PvcTemplate,
    S3StorageSpec,
};
use pxc_common::destination::Destination;
use pxc_common::naming::{
    backup_job_labels, backup_job_name, internal_secret_name, pitr_job_name, prepare_job_name,
    pxc_data_volume_prefix, restore_job_labels, restore_job_name, restore_source_labels,
    restore_source_name, FINALIZER_KEEP_JOB, STORAGE_CA_DIRECTORY, STORAGE_CA_FILE,
};
use pxc_common::Error;

use crate::storage::{
    AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AZURE_STORAGE_ACCOUNT_KEY,
    AZURE_STORAGE_ACCOUNT_NAME,
};

/// Directory the backup claim is mounted at
pub const BACKUP_MOUNT: &str = "/backup";
/// Directory the restored node's data volume is mounted at
pub const DATADIR_MOUNT: &str = "/datadir";
/// Port the PVC restore source streams the backup on
pub const RESTORE_SOURCE_PORT: i32 = 3307;
/// Database user backups and restores connect as
pub const BACKUP_USER: &str = "xtrabackup";

const BACKUP_CONTAINER: &str = "xtrabackup";
const RECOVERY_CLOUD: &str = "/opt/percona/backup/recovery-cloud.sh";
const RECOVERY_PVC_JOINER: &str = "/opt/percona/backup/recovery-pvc-joiner.sh";
const RECOVERY_PVC_DONOR: &str = "/opt/percona/backup/recovery-pvc-donor.sh";
const PREPARE_RESTORED_FILES: &str = "/opt/percona/backup/prepare_restored_files.sh";
const RUN_BACKUP: &str = "/opt/percona/backup/run_backup.sh";
const PITR_BINARY: &str = "/opt/percona/pitr";
const RESTORE_BACKOFF_LIMIT: i32 = 4;

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn claim_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn backup_image(cluster: &PerconaXtraDBCluster) -> Result<String, Error> {
    cluster
        .spec
        .backup
        .as_ref()
        .map(|b| b.image.clone())
        .filter(|image| !image.is_empty())
        .ok_or_else(|| Error::validation("a backup image should be set in the PXC config"))
}

fn service_account(cluster: &PerconaXtraDBCluster) -> Option<String> {
    cluster
        .spec
        .backup
        .as_ref()
        .and_then(|b| b.service_account_name.clone())
}

/// Connection env every job talking to the database gets
fn pxc_env(cluster: &str) -> Vec<EnvVar> {
    vec![
        env("PXC_SERVICE", format!("{cluster}-pxc")),
        env("PXC_USER", BACKUP_USER),
        secret_env("PXC_PASS", &internal_secret_name(cluster), BACKUP_USER),
    ]
}

fn verify_tls_env(verify_tls: Option<bool>) -> EnvVar {
    env("VERIFY_TLS", verify_tls.unwrap_or(true).to_string())
}

/// Mount of the CA bundle of an S3 storage, when it has one
fn ca_bundle(s3: &S3StorageSpec) -> Option<(Volume, VolumeMount)> {
    let reference = s3.ca_bundle.as_ref()?;
    let volume = Volume {
        name: "ca-bundle".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(reference.name.clone()),
            items: Some(vec![KeyToPath {
                key: reference.key.clone(),
                path: STORAGE_CA_FILE.to_string(),
                mode: None,
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    Some((volume, mount("ca-bundle", STORAGE_CA_DIRECTORY)))
}

fn s3_env(s3: &S3StorageSpec, destination: &Destination) -> Vec<EnvVar> {
    let mut vars = vec![
        env("ENDPOINT", s3.endpoint_url.clone()),
        env("S3_BUCKET_URL", destination.path_without_scheme()),
        env("DEFAULT_REGION", s3.region.clone()),
    ];
    if !s3.credentials_secret.is_empty() {
        vars.push(secret_env("ACCESS_KEY_ID", &s3.credentials_secret, AWS_ACCESS_KEY_ID));
        vars.push(secret_env(
            "SECRET_ACCESS_KEY",
            &s3.credentials_secret,
            AWS_SECRET_ACCESS_KEY,
        ));
    }
    vars
}

fn azure_env(secret: &str, endpoint: &str, destination: &Destination) -> Vec<EnvVar> {
    vec![
        env("AZURE_CONTAINER_NAME", destination.bucket().unwrap_or_default()),
        env("AZURE_ENDPOINT", endpoint),
        env(
            "BACKUP_PATH",
            format!("{}{}", destination.prefix(), destination.backup_name()),
        ),
        secret_env("AZURE_STORAGE_ACCOUNT", secret, AZURE_STORAGE_ACCOUNT_NAME),
        secret_env("AZURE_ACCESS_KEY", secret, AZURE_STORAGE_ACCOUNT_KEY),
    ]
}

/// Env and volumes pointing a container at a backup's location
fn storage_env(
    storage_type: BackupStorageType,
    s3: Option<&S3StorageSpec>,
    azure: Option<&pxc_common::crd::AzureStorageSpec>,
    destination: &Destination,
) -> Result<(Vec<EnvVar>, Vec<(Volume, VolumeMount)>), Error> {
    match storage_type {
        BackupStorageType::Filesystem => Ok((vec![], vec![])),
        BackupStorageType::S3 => {
            let s3 = s3.ok_or_else(|| Error::validation("s3 storage has no s3 settings"))?;
            Ok((s3_env(s3, destination), ca_bundle(s3).into_iter().collect()))
        }
        BackupStorageType::Azure => {
            let azure =
                azure.ok_or_else(|| Error::validation("azure storage has no azure settings"))?;
            Ok((
                azure_env(&azure.credentials_secret, &azure.endpoint, destination),
                vec![],
            ))
        }
    }
}

fn job(
    meta: ObjectMeta,
    labels: BTreeMap<String, String>,
    container: Container,
    volumes: Vec<Volume>,
    service_account: Option<String>,
    backoff_limit: Option<i32>,
) -> Job {
    Job {
        metadata: meta,
        spec: Some(JobSpec {
            backoff_limit,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    restart_policy: Some("Never".to_string()),
                    service_account_name: service_account,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The job that takes a backup to `destination`
pub fn backup_job(
    backup: &PerconaXtraDBClusterBackup,
    cluster: &PerconaXtraDBCluster,
    storage: &BackupStorageSpec,
    destination: &Destination,
) -> Result<Job, Error> {
    let name = backup_job_name(&backup.name_any());
    let cluster_name = cluster.name_any();
    let labels = backup_job_labels(&cluster_name, &backup.name_any(), &name);

    let mut vars = pxc_env(&cluster_name);
    vars.push(verify_tls_env(storage.verify_tls));
    let (storage_vars, mounts) = storage_env(
        storage.type_,
        storage.s3.as_ref(),
        storage.azure.as_ref(),
        destination,
    )?;
    vars.extend(storage_vars);

    let (mut volumes, mut volume_mounts): (Vec<_>, Vec<_>) = mounts.into_iter().unzip();
    if let Destination::Pvc { claim } = destination {
        volumes.push(claim_volume("xtrabackup", claim));
        volume_mounts.push(mount("xtrabackup", BACKUP_MOUNT));
    }

    let container = Container {
        name: BACKUP_CONTAINER.to_string(),
        image: Some(backup_image(cluster)?),
        command: Some(vec![RUN_BACKUP.to_string()]),
        env: Some(vars),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    };

    let meta = ObjectMeta {
        name: Some(name),
        namespace: backup.namespace(),
        labels: Some(labels.clone()),
        owner_references: backup.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    };
    Ok(job(
        meta,
        labels,
        container,
        volumes,
        service_account(cluster),
        None,
    ))
}

/// The claim a filesystem backup is written to, owned by the backup
pub fn backup_pvc(
    backup: &PerconaXtraDBClusterBackup,
    cluster: &str,
    template: &PvcTemplate,
) -> PersistentVolumeClaim {
    let name = backup_job_name(&backup.name_any());
    let access_modes = if template.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        template.access_modes.clone()
    };

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: backup.namespace(),
            labels: Some(backup_job_labels(cluster, &backup.name_any(), &name)),
            owner_references: backup.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: template.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(template.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn restore_meta(restore: &PerconaXtraDBClusterRestore, name: String, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: restore.namespace(),
        labels: Some(labels.clone()),
        finalizers: Some(vec![FINALIZER_KEEP_JOB.to_string()]),
        owner_references: restore.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

fn datadir(cluster: &str) -> (Volume, VolumeMount) {
    (
        claim_volume("datadir", &format!("{}0", pxc_data_volume_prefix(cluster))),
        mount("datadir", DATADIR_MOUNT),
    )
}

/// The job that writes a backup into the first node's data volume.
///
/// `source_service` is the PVC restore source the job streams from; cloud
/// backups are read straight from storage.
pub fn restore_job(
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
    backup: &PerconaXtraDBClusterBackupStatus,
    destination: &Destination,
    source_service: Option<&str>,
) -> Result<Job, Error> {
    let cluster_name = cluster.name_any();
    let name = restore_job_name(&restore.name_any(), &cluster_name);
    let labels = restore_job_labels(&cluster_name, &name);

    let mut vars = pxc_env(&cluster_name);
    vars.push(verify_tls_env(backup.verify_tls));
    let (datadir_volume, datadir_mount) = datadir(&cluster_name);
    let mut volumes = vec![datadir_volume];
    let mut volume_mounts = vec![datadir_mount];

    let command = match destination {
        Destination::Pvc { .. } => {
            let service = source_service
                .ok_or_else(|| Error::internal("pvc restore needs a source service"))?;
            vars.push(env("RESTORE_SRC_SERVICE", service));
            RECOVERY_PVC_JOINER
        }
        _ => {
            let storage_type = backup
                .storage_type()
                .unwrap_or_else(|| destination.storage_type());
            let (storage_vars, mounts) = storage_env(
                storage_type,
                backup.s3.as_ref(),
                backup.azure.as_ref(),
                destination,
            )?;
            vars.extend(storage_vars);
            for (volume, m) in mounts {
                volumes.push(volume);
                volume_mounts.push(m);
            }
            RECOVERY_CLOUD
        }
    };

    let container = Container {
        name: BACKUP_CONTAINER.to_string(),
        image: Some(backup_image(cluster)?),
        command: Some(vec![command.to_string()]),
        env: Some(vars),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    Ok(job(
        restore_meta(restore, name, &labels),
        labels,
        container,
        volumes,
        service_account(cluster),
        Some(RESTORE_BACKOFF_LIMIT),
    ))
}

/// Binlog storage a point-in-time recovery reads from.
///
/// An explicit `pitr.backupSource` wins; otherwise the cluster's PITR storage.
pub fn binlog_storage(
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
) -> Result<BackupStorageSpec, Error> {
    if let Some(source) = restore.spec.pitr.as_ref().and_then(|p| p.backup_source.as_ref()) {
        if let Some(s3) = &source.s3 {
            return Ok(BackupStorageSpec {
                type_: BackupStorageType::S3,
                s3: Some(s3.clone()),
                verify_tls: source.verify_tls,
                ..Default::default()
            });
        }
        if let Some(azure) = &source.azure {
            return Ok(BackupStorageSpec {
                type_: BackupStorageType::Azure,
                azure: Some(azure.clone()),
                verify_tls: source.verify_tls,
                ..Default::default()
            });
        }
        if !source.storage_name.is_empty() {
            return cluster.storage(&source.storage_name).cloned();
        }
    }

    let name = cluster
        .spec
        .backup
        .as_ref()
        .map(|b| b.pitr.storage_name.as_str())
        .unwrap_or_default();
    if name.is_empty() {
        return Err(Error::validation("no binlog storage configured for point-in-time recovery"));
    }
    cluster.storage(name).cloned()
}

fn binlog_env(binlogs: &BackupStorageSpec) -> Result<Vec<EnvVar>, Error> {
    match binlogs.type_ {
        BackupStorageType::S3 => {
            let s3 = binlogs
                .s3
                .as_ref()
                .ok_or_else(|| Error::validation("binlog storage has no s3 settings"))?;
            let mut vars = vec![
                env("BINLOG_S3_ENDPOINT", s3.endpoint_url.clone()),
                env("BINLOG_S3_REGION", s3.region.clone()),
                env("BINLOG_S3_BUCKET_URL", s3.bucket.clone()),
            ];
            if !s3.credentials_secret.is_empty() {
                vars.push(secret_env(
                    "BINLOG_ACCESS_KEY_ID",
                    &s3.credentials_secret,
                    AWS_ACCESS_KEY_ID,
                ));
                vars.push(secret_env(
                    "BINLOG_SECRET_ACCESS_KEY",
                    &s3.credentials_secret,
                    AWS_SECRET_ACCESS_KEY,
                ));
            }
            Ok(vars)
        }
        BackupStorageType::Azure => {
            let azure = binlogs
                .azure
                .as_ref()
                .ok_or_else(|| Error::validation("binlog storage has no azure settings"))?;
            Ok(vec![
                env("BINLOG_AZURE_ENDPOINT", azure.endpoint.clone()),
                env("BINLOG_AZURE_CONTAINER_PATH", azure.container_path.clone()),
                secret_env(
                    "BINLOG_AZURE_STORAGE_ACCOUNT",
                    &azure.credentials_secret,
                    AZURE_STORAGE_ACCOUNT_NAME,
                ),
                secret_env(
                    "BINLOG_AZURE_ACCESS_KEY",
                    &azure.credentials_secret,
                    AZURE_STORAGE_ACCOUNT_KEY,
                ),
            ])
        }
        BackupStorageType::Filesystem => Err(Error::validation(
            "binlogs can't be stored on a filesystem storage",
        )),
    }
}

/// The job that replays archived binlogs on top of a restored backup
pub fn pitr_job(
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
    backup: &PerconaXtraDBClusterBackupStatus,
    destination: &Destination,
) -> Result<Job, Error> {
    let target = restore
        .spec
        .pitr
        .as_ref()
        .ok_or_else(|| Error::validation("point-in-time recovery isn't requested"))?;
    let cluster_name = cluster.name_any();
    let name = pitr_job_name(&restore.name_any(), &cluster_name);
    let labels = restore_job_labels(&cluster_name, &name);
    let binlogs = binlog_storage(restore, cluster)?;

    let storage_type = destination.storage_type();
    if storage_type != binlogs.type_ {
        return Err(Error::validation(format!(
            "backup storage {storage_type} and binlog storage {} must be of the same type",
            binlogs.type_
        )));
    }

    let mut vars = pxc_env(&cluster_name);
    vars.push(env("STORAGE_TYPE", storage_type.to_string()));
    vars.push(env("PITR_RECOVERY_TYPE", target.type_.to_string()));
    match target.type_ {
        PitrType::Date => vars.push(env("PITR_DATE", target.date.clone())),
        PitrType::Transaction | PitrType::Skip => vars.push(env("PITR_GTID", target.gtid.clone())),
        PitrType::Latest => {}
    }
    vars.push(verify_tls_env(binlogs.verify_tls.or(backup.verify_tls)));

    let (storage_vars, mounts) = storage_env(
        storage_type,
        backup.s3.as_ref(),
        backup.azure.as_ref(),
        destination,
    )?;
    vars.extend(storage_vars);
    vars.extend(binlog_env(&binlogs)?);
    let (volumes, volume_mounts): (Vec<_>, Vec<_>) = mounts.into_iter().unzip();

    let container = Container {
        name: "pitr".to_string(),
        image: Some(backup_image(cluster)?),
        command: Some(vec![PITR_BINARY.to_string(), "recover".to_string()]),
        env: Some(vars),
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    };

    Ok(job(
        restore_meta(restore, name, &labels),
        labels,
        container,
        volumes,
        service_account(cluster),
        Some(RESTORE_BACKOFF_LIMIT),
    ))
}

/// The job that finalizes restored files before the cluster starts
pub fn prepare_job(
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
) -> Result<Job, Error> {
    let cluster_name = cluster.name_any();
    let name = prepare_job_name(&restore.name_any(), &cluster_name);
    let labels = restore_job_labels(&cluster_name, &name);
    let (volume, volume_mount) = datadir(&cluster_name);

    let container = Container {
        name: "prepare".to_string(),
        image: Some(backup_image(cluster)?),
        command: Some(vec![PREPARE_RESTORED_FILES.to_string()]),
        volume_mounts: Some(vec![volume_mount]),
        ..Default::default()
    };

    Ok(job(
        restore_meta(restore, name, &labels),
        labels,
        container,
        vec![volume],
        service_account(cluster),
        Some(RESTORE_BACKOFF_LIMIT),
    ))
}

/// Pod streaming a PVC backup to the restore job
pub fn restore_source_pod(
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
    claim: &str,
) -> Result<Pod, Error> {
    let name = restore_source_name(&restore.name_any(), claim);
    let labels = restore_source_labels(&cluster.name_any(), &name);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: restore.namespace(),
            labels: Some(labels),
            owner_references: restore.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "ncat".to_string(),
                image: Some(backup_image(cluster)?),
                command: Some(vec![RECOVERY_PVC_DONOR.to_string()]),
                ports: Some(vec![ContainerPort {
                    name: Some("ncat".to_string()),
                    container_port: RESTORE_SOURCE_PORT,
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![mount("backup", BACKUP_MOUNT)]),
                ..Default::default()
            }],
            volumes: Some(vec![claim_volume("backup", claim)]),
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Service in front of [`restore_source_pod`]
pub fn restore_source_service(
    restore: &PerconaXtraDBClusterRestore,
    cluster: &PerconaXtraDBCluster,
    claim: &str,
) -> Service {
    let name = restore_source_name(&restore.name_any(), claim);
    let labels = restore_source_labels(&cluster.name_any(), &name);

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: restore.namespace(),
            labels: Some(labels.clone()),
            owner_references: restore.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("ncat".to_string()),
                port: RESTORE_SOURCE_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Names of every secret referenced by the env of a job's containers
pub fn secret_refs(job: &Job) -> BTreeSet<String> {
    job.spec
        .iter()
        .filter_map(|spec| spec.template.spec.as_ref())
        .flat_map(|pod| pod.containers.iter().chain(pod.init_containers.iter().flatten()))
        .flat_map(|c| c.env.iter().flatten())
        .filter_map(|e| e.value_from.as_ref()?.secret_key_ref.as_ref())
        .map(|r| r.name.clone())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pxc_common::crd::{
        AzureStorageSpec, ClusterBackupSpec, PerconaXtraDBClusterBackupSpec,
        PerconaXtraDBClusterRestoreSpec, PitrSpec, PitrTarget, SecretKeyRef,
    };

    fn cluster() -> PerconaXtraDBCluster {
        let mut storages = BTreeMap::new();
        storages.insert(
            "binlogs".to_string(),
            BackupStorageSpec {
                type_: BackupStorageType::S3,
                s3: Some(S3StorageSpec {
                    bucket: "operator-testing/binlogs".to_string(),
                    credentials_secret: "binlog-creds".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        let mut c = PerconaXtraDBCluster::new(
            "cluster1",
            pxc_common::crd::PerconaXtraDBClusterSpec {
                backup: Some(ClusterBackupSpec {
                    image: "percona/backup:1.18".to_string(),
                    pitr: PitrSpec {
                        enabled: true,
                        storage_name: "binlogs".to_string(),
                        ..Default::default()
                    },
                    storages,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("ns".to_string());
        c
    }

    fn backup() -> PerconaXtraDBClusterBackup {
        let mut b = PerconaXtraDBClusterBackup::new(
            "backup1",
            PerconaXtraDBClusterBackupSpec {
                pxc_cluster: "cluster1".to_string(),
                storage_name: "s3-us-west".to_string(),
                ..Default::default()
            },
        );
        b.metadata.namespace = Some("ns".to_string());
        b.metadata.uid = Some("uid1".to_string());
        b
    }

    fn restore(pitr: Option<PitrTarget>) -> PerconaXtraDBClusterRestore {
        let mut r = PerconaXtraDBClusterRestore::new(
            "restore1",
            PerconaXtraDBClusterRestoreSpec {
                pxc_cluster: "cluster1".to_string(),
                backup_name: "backup1".to_string(),
                pitr,
                ..Default::default()
            },
        );
        r.metadata.namespace = Some("ns".to_string());
        r.metadata.uid = Some("uid2".to_string());
        r
    }

    fn s3_storage() -> S3StorageSpec {
        S3StorageSpec {
            bucket: "operator-testing/nightly".to_string(),
            credentials_secret: "s3-creds".to_string(),
            region: "us-west-2".to_string(),
            ca_bundle: Some(SecretKeyRef {
                name: "minio-ca".to_string(),
                key: "ca.pem".to_string(),
            }),
            ..Default::default()
        }
    }

    fn container(job: &Job) -> &Container {
        &job.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    fn env_value<'a>(c: &'a Container, name: &str) -> Option<&'a str> {
        c.env.as_ref()?.iter().find(|e| e.name == name)?.value.as_deref()
    }

    #[test]
    fn test_s3_backup_job() {
        let destination = Destination::parse("s3://operator-testing/nightly/cluster1-full").unwrap();
        let storage = BackupStorageSpec {
            type_: BackupStorageType::S3,
            s3: Some(s3_storage()),
            verify_tls: Some(false),
            ..Default::default()
        };
        let job = backup_job(&backup(), &cluster(), &storage, &destination).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("xb-backup1"));
        assert_eq!(
            job.metadata.owner_references.as_ref().unwrap()[0].name,
            "backup1"
        );
        let c = container(&job);
        assert_eq!(c.image.as_deref(), Some("percona/backup:1.18"));
        assert_eq!(
            env_value(c, "S3_BUCKET_URL"),
            Some("operator-testing/nightly/cluster1-full")
        );
        assert_eq!(env_value(c, "VERIFY_TLS"), Some("false"));
        assert_eq!(
            c.volume_mounts.as_ref().unwrap()[0].mount_path,
            STORAGE_CA_DIRECTORY
        );
        assert_eq!(
            secret_refs(&job),
            BTreeSet::from(["internal-cluster1".to_string(), "s3-creds".to_string()])
        );
    }

    #[test]
    fn test_pvc_backup_job_mounts_claim() {
        let destination = Destination::pvc("xb-backup1");
        let storage = BackupStorageSpec::default();
        let job = backup_job(&backup(), &cluster(), &storage, &destination).unwrap();

        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "xb-backup1"
        );
        assert_eq!(
            container(&job).volume_mounts.as_ref().unwrap()[0].mount_path,
            BACKUP_MOUNT
        );
    }

    #[test]
    fn test_backup_job_requires_image() {
        let mut c = cluster();
        c.spec.backup.as_mut().unwrap().image.clear();
        let err = backup_job(
            &backup(),
            &c,
            &BackupStorageSpec::default(),
            &Destination::pvc("xb-backup1"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("backup image"));
    }

    #[test]
    fn test_backup_pvc_defaults() {
        let pvc = backup_pvc(
            &backup(),
            "cluster1",
            &PvcTemplate {
                storage_class_name: None,
                size: "6Gi".to_string(),
                access_modes: vec![],
            },
        );
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce"]);
        assert_eq!(
            spec.resources.unwrap().requests.unwrap()["storage"],
            Quantity("6Gi".to_string())
        );
    }

    #[test]
    fn test_restore_job_for_pvc_uses_source_service() {
        let status = PerconaXtraDBClusterBackupStatus {
            destination: "pvc/xb-backup1".to_string(),
            ..Default::default()
        };
        let destination = status.destination().unwrap();
        let job = restore_job(
            &restore(None),
            &cluster(),
            &status,
            &destination,
            Some("restore-src-restore1-xb-backup1"),
        )
        .unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("restore-job-restore1-cluster1"));
        assert_eq!(
            job.metadata.finalizers.as_ref().unwrap(),
            &vec![FINALIZER_KEEP_JOB.to_string()]
        );
        let c = container(&job);
        assert_eq!(c.command.as_ref().unwrap()[0], RECOVERY_PVC_JOINER);
        assert_eq!(
            env_value(c, "RESTORE_SRC_SERVICE"),
            Some("restore-src-restore1-xb-backup1")
        );
        let pod = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(
            pod.volumes.as_ref().unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "datadir-cluster1-pxc-0"
        );
    }

    #[test]
    fn test_azure_restore_job_env() {
        let status = PerconaXtraDBClusterBackupStatus {
            destination: "azure://backups/daily/cluster1-full".to_string(),
            azure: Some(AzureStorageSpec {
                container_path: "backups/daily".to_string(),
                credentials_secret: "azure-creds".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let destination = status.destination().unwrap();
        let job = restore_job(&restore(None), &cluster(), &status, &destination, None).unwrap();
        let c = container(&job);
        assert_eq!(c.command.as_ref().unwrap()[0], RECOVERY_CLOUD);
        assert_eq!(env_value(c, "AZURE_CONTAINER_NAME"), Some("backups"));
        assert_eq!(env_value(c, "BACKUP_PATH"), Some("daily/cluster1-full"));
        assert!(secret_refs(&job).contains("azure-creds"));
    }

    /// Story: a date recovery reads the backup from its own bucket and the
    /// binlogs from the cluster's PITR storage
    #[test]
    fn story_pitr_job_points_at_backup_and_binlogs() {
        let status = PerconaXtraDBClusterBackupStatus {
            destination: "s3://operator-testing/nightly/cluster1-full".to_string(),
            s3: Some(s3_storage()),
            ..Default::default()
        };
        let destination = status.destination().unwrap();
        let target = PitrTarget {
            type_: PitrType::Date,
            date: "2024-01-02 03:04:05".to_string(),
            ..Default::default()
        };
        let job = pitr_job(&restore(Some(target)), &cluster(), &status, &destination).unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("pitr-job-restore1-cluster1"));
        let c = container(&job);
        assert_eq!(c.command.as_ref().unwrap()[1], "recover");
        assert_eq!(env_value(c, "STORAGE_TYPE"), Some("s3"));
        assert_eq!(env_value(c, "PITR_RECOVERY_TYPE"), Some("date"));
        assert_eq!(env_value(c, "PITR_DATE"), Some("2024-01-02 03:04:05"));
        assert_eq!(env_value(c, "PITR_GTID"), None);
        assert_eq!(
            env_value(c, "S3_BUCKET_URL"),
            Some("operator-testing/nightly/cluster1-full")
        );
        assert_eq!(
            env_value(c, "BINLOG_S3_BUCKET_URL"),
            Some("operator-testing/binlogs")
        );
        assert_eq!(
            secret_refs(&job),
            BTreeSet::from([
                "binlog-creds".to_string(),
                "internal-cluster1".to_string(),
                "s3-creds".to_string(),
            ])
        );
    }

    #[test]
    fn test_pitr_backup_source_overrides_cluster_storage() {
        let target = PitrTarget {
            type_: PitrType::Latest,
            backup_source: Some(PerconaXtraDBClusterBackupStatus {
                s3: Some(S3StorageSpec {
                    bucket: "elsewhere/binlogs".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let spec = binlog_storage(&restore(Some(target)), &cluster()).unwrap();
        assert_eq!(spec.s3.unwrap().bucket, "elsewhere/binlogs");

        let spec = binlog_storage(&restore(None), &cluster()).unwrap();
        assert_eq!(spec.s3.unwrap().bucket, "operator-testing/binlogs");
    }

    #[test]
    fn test_pitr_job_rejects_mixed_storage_types() {
        let status = PerconaXtraDBClusterBackupStatus {
            destination: "azure://backups/cluster1-full".to_string(),
            azure: Some(AzureStorageSpec {
                container_path: "backups".to_string(),
                credentials_secret: "azure-creds".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let destination = status.destination().unwrap();
        let err = pitr_job(
            &restore(Some(PitrTarget::default())),
            &cluster(),
            &status,
            &destination,
        )
        .unwrap_err();
        assert!(err.to_string().contains("same type"));
    }

    #[test]
    fn test_restore_source_service_selects_pod() {
        let pod = restore_source_pod(&restore(None), &cluster(), "xb-backup1").unwrap();
        let svc = restore_source_service(&restore(None), &cluster(), "xb-backup1");
        assert_eq!(pod.metadata.name, svc.metadata.name);
        assert_eq!(
            svc.spec.unwrap().selector.unwrap(),
            pod.metadata.labels.unwrap()
        );
    }

    #[test]
    fn test_prepare_job_name() {
        let job = prepare_job(&restore(None), &cluster()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("prepare-job-restore1-cluster1"));
    }
}
