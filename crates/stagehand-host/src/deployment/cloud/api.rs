//! The slice of the managed container service (and its network and
//! filesystem services) that cloud kernels need.
//!
//! [`GatewayClusterApi`] talks to a JSON gateway in front of the service:
//! every call is `POST {endpoint}/{Action}` with a camel-cased JSON body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Task,
    FileSystem,
    MountTarget,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Task => "Task",
            ResourceKind::FileSystem => "FileSystem",
            ResourceKind::MountTarget => "MountTarget",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroup {
    pub group_id: String,
    pub vpc_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDescription {
    pub name: String,
    #[serde(default)]
    pub network_bindings: Vec<PortMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDetail {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub details: Vec<AttachmentDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescription {
    pub task_arn: String,
    #[serde(default)]
    pub last_status: String,
    #[serde(default)]
    pub desired_status: String,
    #[serde(default)]
    pub container_instance_arn: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerDescription>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl TaskDescription {
    pub fn host_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.containers
            .iter()
            .flat_map(|c| c.network_bindings.iter().map(|b| b.host_port))
    }

    /// Id of the elastic network interface of an awsvpc-mode task.
    pub fn network_interface_id(&self) -> Option<&str> {
        self.attachments
            .iter()
            .filter(|a| a.kind == "ElasticNetworkInterface")
            .flat_map(|a| a.details.iter())
            .find(|d| d.name == "networkInterfaceId")
            .map(|d| d.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub family: String,
    pub container_name: String,
    pub image: String,
    pub memory_mb: u32,
    pub cpu_units: u32,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfiguration {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    pub cluster: String,
    pub task_definition: String,
    pub launch_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfiguration>,
    pub container_name: String,
    pub environment: Vec<EnvVar>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTaskResponse {
    #[serde(default)]
    pub tasks: Vec<TaskDescription>,
    #[serde(default)]
    pub failures: Vec<TaskFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemDescription {
    pub file_system_id: String,
    pub life_cycle_state: String,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// ARNs of every cluster visible to the account.
    async fn list_clusters(&self) -> Result<Vec<String>>;

    async fn describe_security_groups(&self, group_name: &str) -> Result<Vec<SecurityGroup>>;

    /// Subnet ids of a VPC.
    async fn describe_subnets(&self, vpc_id: &str) -> Result<Vec<String>>;

    async fn list_tasks(&self, cluster: &str) -> Result<Vec<String>>;

    async fn describe_tasks(&self, cluster: &str, tasks: &[String]) -> Result<Vec<TaskDescription>>;

    /// Returns the `family:revision` of the registered definition.
    async fn register_task_definition(&self, definition: &TaskDefinition) -> Result<String>;

    async fn deregister_task_definition(&self, definition: &str) -> Result<()>;

    async fn run_task(&self, request: &RunTaskRequest) -> Result<RunTaskResponse>;

    async fn stop_task(&self, cluster: &str, task: &str) -> Result<()>;

    /// Public IP associated with a network interface.
    async fn network_interface_ip(&self, interface_id: &str) -> Result<Option<String>>;

    /// Public IP of the instance behind a container instance.
    async fn container_instance_ip(
        &self,
        cluster: &str,
        container_instance: &str,
    ) -> Result<Option<String>>;

    async fn describe_file_systems(&self, creation_token: &str) -> Result<Vec<FileSystemDescription>>;

    /// Returns the new filesystem id.
    async fn create_file_system(&self, creation_token: &str) -> Result<String>;

    /// Returns the new mount target id.
    async fn create_mount_target(
        &self,
        file_system_id: &str,
        subnet_id: &str,
        security_groups: &[String],
    ) -> Result<String>;

    /// Current state of a resource; `Ok(None)` when it is not visible yet.
    /// A confirmed absence is `Err(ResourceNotFound)`.
    async fn describe_resource(
        &self,
        cluster: &str,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<String>>;
}

pub struct GatewayClusterApi {
    client: Client,
    endpoint: Url,
}

impl GatewayClusterApi {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint).map_err(|e| {
            OrchestratorError::Validation(format!("cluster api endpoint '{endpoint}': {e}"))
        })?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("build http client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    async fn call<B, T>(&self, action: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self
            .endpoint
            .join(action)
            .map_err(|e| OrchestratorError::Validation(format!("cluster api action {action}: {e}")))?;
        tracing::trace!(action, "cluster api call");
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::ResourceNotFound(format!("{action}: {body}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Backend(format!(
                "{action} returned {}: {body}",
                status.as_u16()
            )));
        }
        Ok(response.json::<T>().await?)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterList {
    #[serde(default)]
    cluster_arns: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecurityGroupList {
    #[serde(default)]
    security_groups: Vec<SecurityGroup>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubnetList {
    #[serde(default)]
    subnet_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskList {
    #[serde(default)]
    task_arns: Vec<String>,
}

#[derive(Deserialize)]
struct TaskDescriptions {
    #[serde(default)]
    tasks: Vec<TaskDescription>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Registered {
    family: String,
    revision: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicIp {
    #[serde(default)]
    public_ip: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileSystemList {
    #[serde(default)]
    file_systems: Vec<FileSystemDescription>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Created {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceState {
    #[serde(default)]
    state: Option<String>,
}

#[derive(Deserialize)]
struct Empty {}

#[async_trait]
impl ClusterApi for GatewayClusterApi {
    async fn list_clusters(&self) -> Result<Vec<String>> {
        let list: ClusterList = self.call("ListClusters", &json!({})).await?;
        Ok(list.cluster_arns)
    }

    async fn describe_security_groups(&self, group_name: &str) -> Result<Vec<SecurityGroup>> {
        let list: SecurityGroupList = self
            .call("DescribeSecurityGroups", &json!({ "groupName": group_name }))
            .await?;
        Ok(list.security_groups)
    }

    async fn describe_subnets(&self, vpc_id: &str) -> Result<Vec<String>> {
        let list: SubnetList = self
            .call("DescribeSubnets", &json!({ "vpcId": vpc_id }))
            .await?;
        Ok(list.subnet_ids)
    }

    async fn list_tasks(&self, cluster: &str) -> Result<Vec<String>> {
        let list: TaskList = self.call("ListTasks", &json!({ "cluster": cluster })).await?;
        Ok(list.task_arns)
    }

    async fn describe_tasks(&self, cluster: &str, tasks: &[String]) -> Result<Vec<TaskDescription>> {
        let found: TaskDescriptions = self
            .call("DescribeTasks", &json!({ "cluster": cluster, "tasks": tasks }))
            .await?;
        Ok(found.tasks)
    }

    async fn register_task_definition(&self, definition: &TaskDefinition) -> Result<String> {
        let registered: Registered = self.call("RegisterTaskDefinition", definition).await?;
        Ok(format!("{}:{}", registered.family, registered.revision))
    }

    async fn deregister_task_definition(&self, definition: &str) -> Result<()> {
        let _: Empty = self
            .call(
                "DeregisterTaskDefinition",
                &json!({ "taskDefinition": definition }),
            )
            .await?;
        Ok(())
    }

    async fn run_task(&self, request: &RunTaskRequest) -> Result<RunTaskResponse> {
        self.call("RunTask", request).await
    }

    async fn stop_task(&self, cluster: &str, task: &str) -> Result<()> {
        let _: Empty = self
            .call("StopTask", &json!({ "cluster": cluster, "task": task }))
            .await?;
        Ok(())
    }

    async fn network_interface_ip(&self, interface_id: &str) -> Result<Option<String>> {
        let ip: PublicIp = self
            .call(
                "DescribeNetworkInterface",
                &json!({ "networkInterfaceId": interface_id }),
            )
            .await?;
        Ok(ip.public_ip)
    }

    async fn container_instance_ip(
        &self,
        cluster: &str,
        container_instance: &str,
    ) -> Result<Option<String>> {
        let ip: PublicIp = self
            .call(
                "DescribeContainerInstanceIp",
                &json!({ "cluster": cluster, "containerInstance": container_instance }),
            )
            .await?;
        Ok(ip.public_ip)
    }

    async fn describe_file_systems(&self, creation_token: &str) -> Result<Vec<FileSystemDescription>> {
        let list: FileSystemList = self
            .call(
                "DescribeFileSystems",
                &json!({ "creationToken": creation_token }),
            )
            .await?;
        Ok(list.file_systems)
    }

    async fn create_file_system(&self, creation_token: &str) -> Result<String> {
        let created: Created = self
            .call(
                "CreateFileSystem",
                &json!({
                    "creationToken": creation_token,
                    "performanceMode": "generalPurpose",
                    "throughputMode": "bursting",
                    "tags": [{ "key": "Name", "value": creation_token }],
                }),
            )
            .await?;
        Ok(created.id)
    }

    async fn create_mount_target(
        &self,
        file_system_id: &str,
        subnet_id: &str,
        security_groups: &[String],
    ) -> Result<String> {
        let created: Created = self
            .call(
                "CreateMountTarget",
                &json!({
                    "fileSystemId": file_system_id,
                    "subnetId": subnet_id,
                    "securityGroups": security_groups,
                }),
            )
            .await?;
        Ok(created.id)
    }

    async fn describe_resource(
        &self,
        cluster: &str,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<String>> {
        let found: ResourceState = self
            .call(
                "DescribeResource",
                &json!({ "cluster": cluster, "kind": kind.as_str(), "id": id }),
            )
            .await?;
        Ok(found.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_description_exposes_ports_and_interface() {
        let task: TaskDescription = serde_json::from_value(json!({
            "taskArn": "arn:aws:ecs:eu-west-1:1:task/stagehand-kernels/abc",
            "lastStatus": "RUNNING",
            "desiredStatus": "RUNNING",
            "containers": [{
                "name": "kernel",
                "networkBindings": [
                    { "containerPort": 5000, "hostPort": 5010 },
                    { "containerPort": 5001, "hostPort": 5011 }
                ]
            }],
            "attachments": [{
                "type": "ElasticNetworkInterface",
                "details": [
                    { "name": "subnetId", "value": "subnet-1" },
                    { "name": "networkInterfaceId", "value": "eni-42" }
                ]
            }]
        }))
        .unwrap();
        assert_eq!(task.host_ports().collect::<Vec<_>>(), vec![5010, 5011]);
        assert_eq!(task.network_interface_id(), Some("eni-42"));
    }

    #[test]
    fn endpoint_gets_a_trailing_slash() {
        let api = GatewayClusterApi::new("http://127.0.0.1:4566/cluster", Duration::from_secs(1))
            .unwrap();
        assert_eq!(
            api.endpoint.join("ListTasks").unwrap().as_str(),
            "http://127.0.0.1:4566/cluster/ListTasks"
        );
    }

    #[test]
    fn run_task_request_omits_missing_network() {
        let request = RunTaskRequest {
            cluster: "c".into(),
            task_definition: "stagehand-ir:3".into(),
            launch_type: "EC2".into(),
            network: None,
            container_name: "kernel".into(),
            environment: vec![],
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("network").is_none());
        assert_eq!(value["taskDefinition"], "stagehand-ir:3");
    }
}
