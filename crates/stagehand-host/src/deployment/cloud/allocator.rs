//! Host ports and readiness polling for cloud resources.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::api::{ClusterApi, ResourceKind};
use super::cluster::ClusterConfiguration;
use crate::config::CloudConfig;
use crate::error::{OrchestratorError, Result};

pub struct ResourceAllocator {
    api: Arc<dyn ClusterApi>,
    cluster: Arc<ClusterConfiguration>,
    floor: u16,
    ceiling: u16,
    poll_interval: Duration,
    /// Host ports known to be bound. Built on first use, then only updated
    /// by this process's own allocations and releases.
    in_use: Mutex<Option<BTreeSet<u16>>>,
}

impl ResourceAllocator {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        cluster: Arc<ClusterConfiguration>,
        config: &CloudConfig,
    ) -> Self {
        Self {
            api,
            cluster,
            floor: config.port_floor,
            ceiling: config.port_ceiling,
            poll_interval: config.poll_interval,
            in_use: Mutex::new(None),
        }
    }

    /// Reserve `count` host ports nobody else is bound to.
    pub async fn find_available_ports(&self, count: usize) -> Result<Vec<u16>> {
        let mut guard = self.in_use.lock().await;
        if guard.is_none() {
            *guard = Some(self.bound_ports().await?);
        }
        let in_use = guard.get_or_insert_with(BTreeSet::new);
        let found: Vec<u16> = (self.floor..=self.ceiling)
            .filter(|port| !in_use.contains(port))
            .take(count)
            .collect();
        if found.len() < count {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "only {} of {count} ports free between {} and {}",
                found.len(),
                self.floor,
                self.ceiling
            )));
        }
        in_use.extend(found.iter().copied());
        tracing::debug!(ports = ?found, "host ports allocated");
        Ok(found)
    }

    /// Return ports of a stopped task to the pool.
    pub async fn release(&self, ports: &[u16]) {
        if let Some(in_use) = self.in_use.lock().await.as_mut() {
            for port in ports {
                in_use.remove(port);
            }
        }
    }

    async fn bound_ports(&self) -> Result<BTreeSet<u16>> {
        let ctx = self.cluster.get().await?;
        let arns = self.api.list_tasks(&ctx.cluster_arn).await?;
        if arns.is_empty() {
            return Ok(BTreeSet::new());
        }
        let tasks = self.api.describe_tasks(&ctx.cluster_arn, &arns).await?;
        let bound: BTreeSet<u16> = tasks.iter().flat_map(|t| t.host_ports()).collect();
        tracing::debug!(tasks = tasks.len(), ports = bound.len(), "port exclusion set built");
        Ok(bound)
    }

    /// Poll until `id` reports `desired`. Missing or other states retry on a
    /// fixed interval; only a confirmed absence ends the wait early.
    pub async fn wait_for_state(&self, id: &str, kind: ResourceKind, desired: &str) -> Result<()> {
        let ctx = self.cluster.get().await?;
        loop {
            match self.api.describe_resource(&ctx.cluster_arn, kind, id).await? {
                Some(state) if state == desired => return Ok(()),
                state => {
                    tracing::trace!(id, kind = kind.as_str(), ?state, desired, "waiting for state");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::FakeCluster;

    fn allocator(api: Arc<FakeCluster>, config: CloudConfig) -> ResourceAllocator {
        let cluster = Arc::new(ClusterConfiguration::new(api.clone(), &config));
        ResourceAllocator::new(api, cluster, &config)
    }

    #[tokio::test]
    async fn skips_bound_ports_and_never_repeats() {
        let api = Arc::new(FakeCluster::new());
        api.add_running_task(&[5000, 5001, 5003]);
        let allocator = allocator(api.clone(), CloudConfig::default());

        let first = allocator.find_available_ports(3).await.unwrap();
        assert_eq!(first, vec![5002, 5004, 5005]);
        let second = allocator.find_available_ports(2).await.unwrap();
        assert_eq!(second, vec![5006, 5007]);
        assert_eq!(api.calls("ListTasks"), 1);

        allocator.release(&first).await;
        let third = allocator.find_available_ports(1).await.unwrap();
        assert_eq!(third, vec![5002]);
    }

    #[tokio::test]
    async fn exhausted_range_is_an_error() {
        let api = Arc::new(FakeCluster::new());
        api.add_running_task(&[5001]);
        let config = CloudConfig {
            port_floor: 5000,
            port_ceiling: 5002,
            ..CloudConfig::default()
        };
        let allocator = allocator(api, config);
        assert!(matches!(
            allocator.find_available_ports(3).await,
            Err(OrchestratorError::ResourceExhausted(_))
        ));
        assert_eq!(allocator.find_available_ports(2).await.unwrap(), vec![5000, 5002]);
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_on_the_fourth_poll() {
        let api = Arc::new(FakeCluster::new());
        let arn = api.add_running_task(&[]);
        api.hide_resource_for(3);
        let config = CloudConfig::default();
        let interval = config.poll_interval;
        let allocator = allocator(api.clone(), config);

        let started = tokio::time::Instant::now();
        allocator
            .wait_for_state(&arn, ResourceKind::Task, "RUNNING")
            .await
            .unwrap();
        assert_eq!(api.calls("DescribeResource"), 4);
        assert!(started.elapsed() >= interval * 3);
        assert!(started.elapsed() < interval * 4);
    }

    #[tokio::test]
    async fn confirmed_absence_is_not_found() {
        let api = Arc::new(FakeCluster::new());
        let allocator = allocator(api, CloudConfig::default());
        assert!(matches!(
            allocator
                .wait_for_state("arn:missing", ResourceKind::Task, "RUNNING")
                .await,
            Err(OrchestratorError::ResourceNotFound(_))
        ));
    }
}
