//! One-time discovery of the cluster and the network kernels run in.

use std::sync::Arc;

use tokio::sync::OnceCell;

use super::api::{ClusterApi, NetworkConfiguration};
use crate::config::{CloudConfig, LaunchType};
use crate::error::{OrchestratorError, Result};
use crate::util::short_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterContext {
    pub cluster_arn: String,
    pub network: NetworkConfiguration,
}

pub struct ClusterConfiguration {
    api: Arc<dyn ClusterApi>,
    cluster: String,
    security_group: String,
    launch_type: LaunchType,
    context: OnceCell<Arc<ClusterContext>>,
}

impl ClusterConfiguration {
    pub fn new(api: Arc<dyn ClusterApi>, config: &CloudConfig) -> Self {
        Self {
            api,
            cluster: config.cluster.clone(),
            security_group: config.security_group.clone(),
            launch_type: config.launch_type,
            context: OnceCell::new(),
        }
    }

    /// Kick off discovery in the background.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.get().await {
                Ok(ctx) => tracing::info!(cluster = %ctx.cluster_arn, "cluster configuration ready"),
                Err(err) => tracing::error!(error = %err, "cluster discovery failed"),
            }
        });
    }

    /// Resolves at once when discovery has completed, otherwise joins it.
    /// A failed discovery is not cached; the next caller retries.
    pub async fn get(&self) -> Result<Arc<ClusterContext>> {
        self.context
            .get_or_try_init(|| async { self.discover().await.map(Arc::new) })
            .await
            .cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.context.initialized()
    }

    async fn discover(&self) -> Result<ClusterContext> {
        let (cluster_arn, network) = tokio::try_join!(self.cluster_arn(), self.network())?;
        Ok(ClusterContext {
            cluster_arn,
            network,
        })
    }

    async fn cluster_arn(&self) -> Result<String> {
        self.api
            .list_clusters()
            .await?
            .into_iter()
            .find(|arn| short_id(arn) == self.cluster)
            .ok_or_else(|| {
                OrchestratorError::ResourceNotFound(format!("cluster '{}'", self.cluster))
            })
    }

    async fn network(&self) -> Result<NetworkConfiguration> {
        let group = self
            .api
            .describe_security_groups(&self.security_group)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                OrchestratorError::ResourceNotFound(format!(
                    "security group '{}'",
                    self.security_group
                ))
            })?;
        let subnets = self.api.describe_subnets(&group.vpc_id).await?;
        if subnets.is_empty() {
            return Err(OrchestratorError::ResourceNotFound(format!(
                "subnets of {}",
                group.vpc_id
            )));
        }
        Ok(NetworkConfiguration {
            subnets,
            security_groups: vec![group.group_id],
            assign_public_ip: self.launch_type == LaunchType::Fargate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::FakeCluster;

    #[tokio::test]
    async fn discovers_cluster_and_network_once() {
        let api = Arc::new(FakeCluster::new());
        let config = CloudConfig::default();
        let cluster = ClusterConfiguration::new(api.clone(), &config);
        assert!(!cluster.is_ready());

        let (a, b) = tokio::join!(cluster.get(), cluster.get());
        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(a.cluster_arn.ends_with("/stagehand-kernels"));
        assert_eq!(a.network.subnets, vec!["subnet-a", "subnet-b"]);
        assert!(a.network.assign_public_ip);
        assert_eq!(api.calls("ListClusters"), 1);
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found_and_retried() {
        let api = Arc::new(FakeCluster::new());
        let config = CloudConfig {
            cluster: "elsewhere".into(),
            ..CloudConfig::default()
        };
        let cluster = ClusterConfiguration::new(api.clone(), &config);
        assert!(matches!(
            cluster.get().await,
            Err(OrchestratorError::ResourceNotFound(_))
        ));
        assert!(cluster.get().await.is_err());
        assert_eq!(api.calls("ListClusters"), 2);
    }
}
