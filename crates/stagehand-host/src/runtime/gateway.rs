//! Reaching runtimes that live in containers: the connection-config handoff
//! to the helper service, the runtime socket and the package endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use url::Url;

use super::{Endpoint, NdjsonRuntime, RuntimeHandle};
use crate::config::GatewayConfig;
use crate::error::{OrchestratorError, Result};

/// Names of the runtime ports, in the order they are allocated.
pub const PORT_NAMES: [&str; 5] = ["shell", "iopub", "stdin", "control", "hb"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigRequest {
    pub id: String,
    pub ip: String,
    pub kernel_name: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct PackageResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

#[async_trait]
pub trait KernelGateway: Send + Sync {
    /// Ask the helper to write the connection file for a runtime at `ip`.
    async fn create_config(&self, request: &ConfigRequest) -> Result<Value>;

    async fn connect(
        &self,
        runtime_name: &str,
        kernel_id: &str,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RuntimeHandle>>;

    /// Returns the packages that ended up installed.
    async fn install_package(&self, endpoint: &Endpoint, package: &str) -> Result<Vec<String>>;

    async fn remove_package(&self, endpoint: &Endpoint, package: &str) -> Result<String>;
}

pub struct HttpKernelGateway {
    client: Client,
    helper: Url,
}

impl HttpKernelGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let helper = Url::parse(&config.helper_url).map_err(|e| {
            OrchestratorError::Validation(format!("helper url '{}': {e}", config.helper_url))
        })?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OrchestratorError::Internal(format!("build http client: {e}")))?;
        Ok(Self { client, helper })
    }

    fn package_url(endpoint: &Endpoint, action: &str, package: &str) -> Result<Url> {
        let port = endpoint.ports.last().ok_or_else(|| {
            OrchestratorError::Validation("endpoint has no package port".into())
        })?;
        let mut url = Url::parse(&format!("http://{}:{port}/", endpoint.host))
            .map_err(|e| OrchestratorError::Validation(format!("bad endpoint: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| OrchestratorError::Validation("endpoint cannot carry a path".into()))?
            .pop_if_empty()
            .push(action)
            .push(package);
        Ok(url)
    }

    async fn package_call(&self, url: Url) -> Result<PackageResponse> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::Backend(format!(
                "package endpoint returned {status}: {body}"
            )));
        }
        let reply = response.json::<PackageResponse>().await?;
        if !reply.success {
            return Err(OrchestratorError::Runtime(reply.message));
        }
        Ok(reply)
    }
}

#[async_trait]
impl KernelGateway for HttpKernelGateway {
    async fn create_config(&self, request: &ConfigRequest) -> Result<Value> {
        let mut url = self
            .helper
            .join("create-kernel-config")
            .map_err(|e| OrchestratorError::Validation(format!("helper url: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("id", &request.id)
                .append_pair("ip", &request.ip)
                .append_pair("kernel_name", &request.kernel_name);
            for (name, port) in PORT_NAMES.iter().zip(&request.ports) {
                query.append_pair(&format!("{name}_port"), &port.to_string());
            }
        }
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Backend(format!(
                "helper rejected config for {}: {}",
                request.id,
                response.status()
            )));
        }
        Ok(response.json::<Value>().await?)
    }

    async fn connect(
        &self,
        runtime_name: &str,
        kernel_id: &str,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        let port = endpoint.ports.first().copied().ok_or_else(|| {
            OrchestratorError::Validation(format!("kernel {kernel_id} has no runtime port"))
        })?;
        let stream = TcpStream::connect((endpoint.host.as_str(), port))
            .await
            .map_err(|e| {
                OrchestratorError::Backend(format!(
                    "connect to runtime {kernel_id} at {}:{port}: {e}",
                    endpoint.host
                ))
            })?;
        let (reader, writer) = stream.into_split();
        let runtime = NdjsonRuntime::start(runtime_name, reader, writer).await?;
        Ok(Arc::new(runtime))
    }

    async fn install_package(&self, endpoint: &Endpoint, package: &str) -> Result<Vec<String>> {
        let reply = self
            .package_call(Self::package_url(endpoint, "install", package)?)
            .await?;
        Ok(match reply.result {
            Value::Array(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Value::String(one) => vec![one],
            _ => vec![package.to_string()],
        })
    }

    async fn remove_package(&self, endpoint: &Endpoint, package: &str) -> Result<String> {
        let reply = self
            .package_call(Self::package_url(endpoint, "remove", package)?)
            .await?;
        Ok(reply.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_url_uses_last_port_and_escapes_name() {
        let endpoint = Endpoint {
            host: "10.0.0.4".into(),
            ports: vec![5000, 5001, 5002, 5003, 5004, 5005],
        };
        let url = HttpKernelGateway::package_url(&endpoint, "install", "data table").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.4:5005/install/data%20table");
    }

    #[test]
    fn package_url_requires_a_port() {
        let endpoint = Endpoint {
            host: "10.0.0.4".into(),
            ports: vec![],
        };
        assert!(HttpKernelGateway::package_url(&endpoint, "install", "x").is_err());
    }
}
