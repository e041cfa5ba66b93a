//! Kubernetes Secrets storage driver
//!
//! One Secret per revision, named after [`StoredRelease::storage_key`] and
//! labelled for selection by release name. The payload is JSON, compressed,
//! then base64 encoded. `create` relies on the API server rejecting a
//! duplicate name with 409 Conflict; `update_if` replaces the Secret at the
//! `resourceVersion` it checked, so a concurrent write also ends in 409.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use std::collections::BTreeMap;

use super::{
    CompressionMethod, MANAGED_BY, MANAGED_BY_LABEL, NAME_LABEL, StorageConfig, StorageDriver,
    decode_from_storage, encode_for_storage, ensure_status, sort_history, storage_labels,
};
use crate::config::EngineConfig;
use crate::error::{KubeError, Result};
use crate::release::{ReleaseStatus, StoredRelease, storage_key};

const SECRET_TYPE: &str = "rudder.io/release.v1";
const COMPRESSION_LABEL: &str = "rudder.io/compression";
const DATA_KEY: &str = "release";

/// Kubernetes Secrets storage driver
#[derive(Clone)]
pub struct SecretsDriver {
    client: Client,
    config: StorageConfig,
}

impl SecretsDriver {
    /// Create a driver from the ambient kubeconfig / in-cluster config
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    pub fn with_client(client: Client, config: StorageConfig) -> Self {
        Self { client, config }
    }

    /// Create a driver using the storage settings of an engine config
    pub fn from_config(client: Client, config: &EngineConfig) -> Self {
        Self::with_client(client, config.storage.clone())
    }

    fn secrets_api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_secret(&self, release: &StoredRelease) -> Result<Secret> {
        let encoded = encode_for_storage(release, &self.config)?;

        let mut labels = storage_labels(release);
        labels.insert(
            COMPRESSION_LABEL.to_string(),
            compression_label(self.config.compression).to_string(),
        );

        let data = BTreeMap::from([(
            DATA_KEY.to_string(),
            k8s_openapi::ByteString(encoded.into_bytes()),
        )]);

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(release.storage_key()),
                namespace: Some(release.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    fn parse_secret(&self, secret: &Secret) -> Result<StoredRelease> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DATA_KEY))
            .ok_or_else(|| KubeError::Storage("secret missing 'release' data".to_string()))?;

        let encoded = std::str::from_utf8(&data.0)
            .map_err(|e| KubeError::Storage(format!("invalid UTF-8 in secret: {}", e)))?;

        let compression = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(COMPRESSION_LABEL))
            .and_then(|c| compression_from_label(c))
            .unwrap_or(self.config.compression);

        decode_from_storage(encoded, compression)
    }

    async fn list_secrets(&self, api: Api<Secret>, name: Option<&str>) -> Result<Vec<StoredRelease>> {
        let mut selector = format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY);
        if let Some(n) = name {
            selector.push_str(&format!(",{}={}", NAME_LABEL, n));
        }

        let secrets = api.list(&ListParams::default().labels(&selector)).await?;
        let mut releases = secrets
            .items
            .iter()
            .map(|s| self.parse_secret(s))
            .collect::<Result<Vec<_>>>()?;
        sort_history(&mut releases);
        Ok(releases)
    }
}

fn compression_label(method: CompressionMethod) -> &'static str {
    match method {
        CompressionMethod::None => "none",
        CompressionMethod::Gzip { .. } => "gzip",
        CompressionMethod::Zstd { .. } => "zstd",
    }
}

/// Decoding ignores the level, so any level works here
fn compression_from_label(label: &str) -> Option<CompressionMethod> {
    match label {
        "none" => Some(CompressionMethod::None),
        "gzip" => Some(CompressionMethod::Gzip { level: 6 }),
        "zstd" => Some(CompressionMethod::Zstd { level: 3 }),
        _ => None,
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[async_trait]
impl StorageDriver for SecretsDriver {
    async fn get(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        match self.secrets_api(namespace).get(&storage_key(name, version)).await {
            Ok(secret) => self.parse_secret(&secret),
            Err(e) if is_status(&e, 404) => Err(KubeError::RevisionNotFound {
                name: name.to_string(),
                version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let releases = self
            .list_secrets(self.secrets_api(namespace), Some(name))
            .await?;
        if releases.is_empty() {
            return Err(KubeError::ReleaseNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            });
        }
        Ok(releases)
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<StoredRelease>> {
        let api = match namespace {
            Some(ns) => self.secrets_api(ns),
            None => Api::all(self.client.clone()),
        };
        self.list_secrets(api, name).await
    }

    async fn create(&self, release: &StoredRelease) -> Result<()> {
        let secret = self.build_secret(release)?;
        match self
            .secrets_api(&release.namespace)
            .create(&PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Err(KubeError::RevisionExists {
                name: release.name.clone(),
                version: release.version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, release: &StoredRelease) -> Result<()> {
        let secret = self.build_secret(release)?;
        match self
            .secrets_api(&release.namespace)
            .replace(&release.storage_key(), &PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(KubeError::RevisionNotFound {
                name: release.name.clone(),
                version: release.version,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_if(&self, release: &StoredRelease, expected: ReleaseStatus) -> Result<()> {
        let api = self.secrets_api(&release.namespace);
        let not_found = || KubeError::RevisionNotFound {
            name: release.name.clone(),
            version: release.version,
        };

        let current = match api.get(&release.storage_key()).await {
            Ok(secret) => secret,
            Err(e) if is_status(&e, 404) => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        ensure_status(&self.parse_secret(&current)?, expected)?;

        let mut secret = self.build_secret(release)?;
        secret.metadata.resource_version = current.metadata.resource_version;
        match api
            .replace(&release.storage_key(), &PostParams::default(), &secret)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(not_found()),
            Err(e) if is_status(&e, 409) => Err(KubeError::StatusConflict {
                name: release.name.clone(),
                version: release.version,
                expected: expected.to_string(),
                actual: "changed concurrently".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, name: &str, version: u32) -> Result<StoredRelease> {
        let release = self.get(namespace, name, version).await?;
        match self
            .secrets_api(namespace)
            .delete(&release.storage_key(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(release),
            Err(e) if is_status(&e, 404) => Ok(release),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self, namespace: &str, name: &str) -> Result<Vec<StoredRelease>> {
        let releases = self.history(namespace, name).await?;
        let api = self.secrets_api(namespace);
        for release in &releases {
            match api
                .delete(&release.storage_key(), &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(e) if is_status(&e, 404) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(releases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_label_round_trip() {
        for method in [
            CompressionMethod::None,
            CompressionMethod::Gzip { level: 9 },
            CompressionMethod::Zstd { level: 19 },
        ] {
            let parsed = compression_from_label(compression_label(method)).unwrap();
            assert_eq!(compression_label(parsed), compression_label(method));
        }
        assert!(compression_from_label("lz4").is_none());
    }

    #[test]
    fn test_secret_name_is_valid_dns_subdomain() {
        let key = storage_key("my-app", 12);
        assert_eq!(key, "rudder.release.v1.my-app.v12");
        assert!(key.len() <= 253);
        assert!(
            key.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        );
    }
}
