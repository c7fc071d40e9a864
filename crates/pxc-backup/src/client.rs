//! Kubernetes API access for the backup and restore controllers
//!
//! Everything the controllers read or write goes through [`KubeClient`] so
//! reconcile logic can be driven by mocks in tests.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions,
};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncReadExt;

use pxc_common::crd::{
    PerconaXtraDBCluster, PerconaXtraDBClusterBackup, PerconaXtraDBClusterBackupStatus,
    PerconaXtraDBClusterRestore, PerconaXtraDBClusterRestoreStatus,
};
use pxc_common::kube_utils::{merge_patch, patch_resource_status};
use pxc_common::retry::{retry_on_conflict, RetryConfig};
use pxc_common::{Error, FIELD_MANAGER};

/// Output of a command run in a container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// True when the command exited with status 0
    pub success: bool,
}

/// Trait abstracting Kubernetes client operations for backups and restores
///
/// Deletes treat a missing object as success. Creates return the API error
/// unchanged so callers can tolerate "already exists" where it is expected.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a backup by name
    async fn get_backup(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PerconaXtraDBClusterBackup>, Error>;

    /// Merge-patch the status of a backup
    async fn patch_backup_status(
        &self,
        name: &str,
        namespace: &str,
        status: &PerconaXtraDBClusterBackupStatus,
    ) -> Result<(), Error>;

    /// Replace the finalizer list of a backup
    async fn set_backup_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Get a cluster by name
    async fn get_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PerconaXtraDBCluster>, Error>;

    /// Merge-patch the spec or metadata of a cluster
    async fn patch_cluster(
        &self,
        name: &str,
        namespace: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error>;

    /// List the restores of a namespace
    async fn list_restores(&self, namespace: &str)
        -> Result<Vec<PerconaXtraDBClusterRestore>, Error>;

    /// Merge-patch the status of a restore
    async fn patch_restore_status(
        &self,
        name: &str,
        namespace: &str,
        status: &PerconaXtraDBClusterRestoreStatus,
    ) -> Result<(), Error>;

    /// Get a job by name
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error>;

    /// Create a job
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error>;

    /// Merge-patch a job (suspend, resume, annotations)
    async fn patch_job(
        &self,
        name: &str,
        namespace: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error>;

    /// Delete a job and its pods
    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a lease by name
    async fn get_lease(&self, name: &str, namespace: &str) -> Result<Option<Lease>, Error>;

    /// Create a lease, 409 when it already exists
    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, Error>;

    /// Delete a lease if it still has the given uid and resourceVersion,
    /// 409 when it doesn't
    async fn delete_lease(
        &self,
        name: &str,
        namespace: &str,
        preconditions: Preconditions,
    ) -> Result<(), Error>;

    /// Get a secret by name
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Delete a secret
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a pod by name
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Delete a pod
    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Create a service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Delete a service
    async fn delete_service(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Get a persistent volume claim by name
    async fn get_pvc(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// List all persistent volume claims of a namespace
    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, Error>;

    /// Create a persistent volume claim
    async fn create_pvc(&self, namespace: &str, pvc: &PersistentVolumeClaim)
        -> Result<(), Error>;

    /// Delete a persistent volume claim
    async fn delete_pvc(&self, name: &str, namespace: &str) -> Result<(), Error>;

    /// Run a command in a container and collect its output
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_ignore_missing<K>(api: &Api<K>, name: &str, dp: &DeleteParams) -> Result<(), Error>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, dp).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_backup(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PerconaXtraDBClusterBackup>, Error> {
        get_opt(&self.api(namespace), name).await
    }

    async fn patch_backup_status(
        &self,
        name: &str,
        namespace: &str,
        status: &PerconaXtraDBClusterBackupStatus,
    ) -> Result<(), Error> {
        retry_on_conflict(&RetryConfig::conflict(), "backup status", || async {
            patch_resource_status::<PerconaXtraDBClusterBackup>(
                &self.client,
                name,
                namespace,
                status,
                FIELD_MANAGER,
            )
            .await
            .map_err(Error::from)
        })
        .await
    }

    async fn set_backup_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        merge_patch::<PerconaXtraDBClusterBackup>(&self.client, name, namespace, &patch, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn get_cluster(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PerconaXtraDBCluster>, Error> {
        get_opt(&self.api(namespace), name).await
    }

    async fn patch_cluster(
        &self,
        name: &str,
        namespace: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error> {
        merge_patch::<PerconaXtraDBCluster>(&self.client, name, namespace, &patch, FIELD_MANAGER)
            .await?;
        Ok(())
    }

    async fn list_restores(
        &self,
        namespace: &str,
    ) -> Result<Vec<PerconaXtraDBClusterRestore>, Error> {
        let api: Api<PerconaXtraDBClusterRestore> = self.api(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_restore_status(
        &self,
        name: &str,
        namespace: &str,
        status: &PerconaXtraDBClusterRestoreStatus,
    ) -> Result<(), Error> {
        retry_on_conflict(&RetryConfig::conflict(), "restore status", || async {
            patch_resource_status::<PerconaXtraDBClusterRestore>(
                &self.client,
                name,
                namespace,
                status,
                FIELD_MANAGER,
            )
            .await
            .map_err(Error::from)
        })
        .await
    }

    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error> {
        get_opt(&self.api(namespace), name).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), Error> {
        let api: Api<Job> = self.api(namespace);
        api.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn patch_job(
        &self,
        name: &str,
        namespace: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Job> = self.api(namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_job(&self, name: &str, namespace: &str) -> Result<(), Error> {
        // Background propagation so the job's pods go with it
        delete_ignore_missing::<Job>(&self.api(namespace), name, &DeleteParams::background())
            .await
    }

    async fn get_lease(&self, name: &str, namespace: &str) -> Result<Option<Lease>, Error> {
        get_opt(&self.api(namespace), name).await
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease, Error> {
        let api: Api<Lease> = self.api(namespace);
        Ok(api.create(&PostParams::default(), lease).await?)
    }

    async fn delete_lease(
        &self,
        name: &str,
        namespace: &str,
        preconditions: Preconditions,
    ) -> Result<(), Error> {
        let params = DeleteParams {
            preconditions: Some(preconditions),
            ..DeleteParams::default()
        };
        delete_ignore_missing::<Lease>(&self.api(namespace), name, &params).await
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        get_opt(&self.api(namespace), name).await
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<(), Error> {
        delete_ignore_missing::<Secret>(&self.api(namespace), name, &DeleteParams::default())
            .await
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Option<Pod>, Error> {
        get_opt(&self.api(namespace), name).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = self.api(namespace);
        api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), Error> {
        delete_ignore_missing::<Pod>(&self.api(namespace), name, &DeleteParams::default()).await
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = self.api(namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str, namespace: &str) -> Result<(), Error> {
        delete_ignore_missing::<Service>(&self.api(namespace), name, &DeleteParams::default())
            .await
    }

    async fn get_pvc(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        get_opt(&self.api(namespace), name).await
    }

    async fn list_pvcs(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = self.api(namespace);
        api.create(&PostParams::default(), pvc).await?;
        Ok(())
    }

    async fn delete_pvc(&self, name: &str, namespace: &str) -> Result<(), Error> {
        delete_ignore_missing::<PersistentVolumeClaim>(
            &self.api(namespace),
            name,
            &DeleteParams::default(),
        )
        .await
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput, Error> {
        let api: Api<Pod> = self.api(namespace);
        let params = AttachParams::default()
            .container(container)
            .stdout(true)
            .stderr(true);
        let mut attached = api.exec(pod, command, &params).await?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let success = status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .is_some_and(|s| s == "Success");

        Ok(ExecOutput {
            stdout: stdout.map_err(|e| exec_error(pod, e))?,
            stderr: stderr.map_err(|e| exec_error(pod, e))?,
            success,
        })
    }
}

async fn read_stream(
    stream: Option<impl tokio::io::AsyncRead + Unpin>,
) -> std::io::Result<String> {
    let mut out = String::new();
    if let Some(mut stream) = stream {
        stream.read_to_string(&mut out).await?;
    }
    Ok(out)
}

fn exec_error(pod: &str, e: std::io::Error) -> Error {
    Error::internal_with_context("exec", format!("read output of pod {pod}: {e}"))
}
