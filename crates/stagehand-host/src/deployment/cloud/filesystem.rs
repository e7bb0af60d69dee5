//! Per-user shared filesystems mounted into cloud kernels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::try_join_all;
use tokio::sync::OnceCell;

use super::allocator::ResourceAllocator;
use super::api::{ClusterApi, ResourceKind};
use super::cluster::ClusterConfiguration;
use crate::error::Result;

const AVAILABLE: &str = "available";

pub struct SharedFileSystems {
    api: Arc<dyn ClusterApi>,
    cluster: Arc<ClusterConfiguration>,
    allocator: Arc<ResourceAllocator>,
    by_token: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl SharedFileSystems {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        cluster: Arc<ClusterConfiguration>,
        allocator: Arc<ResourceAllocator>,
    ) -> Self {
        Self {
            api,
            cluster,
            allocator,
            by_token: Mutex::new(HashMap::new()),
        }
    }

    /// Id of the filesystem for `token`, creating it on first use.
    /// Concurrent callers for one token share a single creation.
    pub async fn ensure(&self, token: &str) -> Result<String> {
        let cell = {
            let mut by_token = self.by_token.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(by_token.entry(token.to_string()).or_default())
        };
        cell.get_or_try_init(|| self.find_or_create(token))
            .await
            .cloned()
    }

    async fn find_or_create(&self, token: &str) -> Result<String> {
        if let Some(existing) = self.api.describe_file_systems(token).await?.into_iter().next() {
            return Ok(existing.file_system_id);
        }
        tracing::info!(token, "creating shared filesystem");
        let ctx = self.cluster.get().await?;
        let fs_id = self.api.create_file_system(token).await?;
        self.allocator
            .wait_for_state(&fs_id, ResourceKind::FileSystem, AVAILABLE)
            .await?;

        let targets = try_join_all(ctx.network.subnets.iter().map(|subnet| {
            self.api
                .create_mount_target(&fs_id, subnet, &ctx.network.security_groups)
        }))
        .await?;
        try_join_all(targets.iter().map(|target| {
            self.allocator
                .wait_for_state(target, ResourceKind::MountTarget, AVAILABLE)
        }))
        .await?;
        tracing::info!(token, fs_id = %fs_id, mount_targets = targets.len(), "shared filesystem ready");
        Ok(fs_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudConfig;
    use crate::testkit::FakeCluster;

    fn filesystems(api: Arc<FakeCluster>) -> SharedFileSystems {
        let config = CloudConfig::default();
        let cluster = Arc::new(ClusterConfiguration::new(api.clone(), &config));
        let allocator = Arc::new(ResourceAllocator::new(api.clone(), cluster.clone(), &config));
        SharedFileSystems::new(api, cluster, allocator)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_creation() {
        let api = Arc::new(FakeCluster::new());
        let filesystems = filesystems(api.clone());
        let (a, b) = tokio::join!(filesystems.ensure("ada@example.com"), filesystems.ensure("ada@example.com"));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(api.calls("CreateFileSystem"), 1);
        assert_eq!(api.calls("CreateMountTarget"), 2);

        filesystems.ensure("grace@example.com").await.unwrap();
        assert_eq!(api.calls("CreateFileSystem"), 2);
    }

    #[tokio::test]
    async fn existing_filesystem_is_reused() {
        let api = Arc::new(FakeCluster::new());
        let first = filesystems(api.clone()).ensure("ada@example.com").await.unwrap();
        let again = filesystems(api.clone()).ensure("ada@example.com").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(api.calls("CreateFileSystem"), 1);
    }
}
