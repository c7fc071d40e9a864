//! Connection settings for the supported backends

use std::fmt;

/// S3-compatible storage settings
#[derive(Clone, Default)]
pub struct S3Options {
    /// Bucket name
    pub bucket: String,
    /// Key prefix inside the bucket
    pub prefix: String,
    /// Region, `us-east-1` when empty
    pub region: String,
    /// Endpoint of an S3-compatible service, AWS when empty
    pub endpoint: String,
    /// Access key; instance credentials are used when empty
    pub access_key_id: String,
    /// Secret key
    pub secret_access_key: String,
    /// Verify the endpoint certificate
    pub verify_tls: bool,
    /// PEM bundle of extra trusted CAs
    pub ca_bundle: Option<Vec<u8>>,
}

impl fmt::Debug for S3Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Options")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &redacted(&self.access_key_id))
            .field("verify_tls", &self.verify_tls)
            .field("ca_bundle", &self.ca_bundle.as_ref().map(|b| b.len()))
            .finish()
    }
}

/// Azure Blob storage settings
#[derive(Clone, Default)]
pub struct AzureOptions {
    /// Container name
    pub container: String,
    /// Key prefix inside the container
    pub prefix: String,
    /// Storage account
    pub account: String,
    /// Shared access key
    pub access_key: String,
    /// Blob endpoint, `https://<account>.blob.core.windows.net` when empty
    pub endpoint: String,
}

impl fmt::Debug for AzureOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureOptions")
            .field("container", &self.container)
            .field("prefix", &self.prefix)
            .field("account", &self.account)
            .field("access_key", &redacted(&self.access_key))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Backend selection
#[derive(Clone, Debug)]
pub enum StorageOptions {
    /// S3-compatible storage
    S3(S3Options),
    /// Azure Blob storage
    Azure(AzureOptions),
}

impl StorageOptions {
    /// Initial key prefix
    pub fn prefix(&self) -> &str {
        match self {
            Self::S3(o) => &o.prefix,
            Self::Azure(o) => &o.prefix,
        }
    }
}

/// Endpoint URL for `object_store` from a configured S3 endpoint.
///
/// Empty or the AWS default host means AWS itself; a bare host gets `https://`.
pub fn s3_endpoint(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    let host = raw
        .strip_prefix("https://")
        .or_else(|| raw.strip_prefix("http://"))
        .unwrap_or(raw);
    if host.is_empty() || host == AWS_DEFAULT_HOST {
        return String::new();
    }
    if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    }
}

/// Endpoint the operator images assume when none is configured
pub const AWS_DEFAULT_HOST: &str = "s3.amazonaws.com";

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}
