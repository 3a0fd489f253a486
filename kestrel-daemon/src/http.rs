//! JSON-over-HTTP daemon client.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use kestrel_types::VirtualMachine;

use crate::addr::http_base_url;
use crate::pool::DaemonConnector;
use crate::{
    DaemonError, DaemonResult, DaemonSnapshot, DaemonVmStatus, DownloadRequest, NodeDaemon,
    PoolFileEntry, PoolInitResult, RemoteDownloadStatus,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one node daemon.
pub struct HttpDaemon {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct FileListBody {
    entries: Vec<PoolFileEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStartedBody {
    job_id: String,
}

impl HttpDaemon {
    /// Creates a client for the given management address.
    pub fn new(addr: &str) -> DaemonResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .connect_timeout(DIAL_TIMEOUT)
            .build()
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: http_base_url(addr),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> DaemonResult<T> {
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(DaemonError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| DaemonError::Protocol(e.to_string()))
    }

    async fn check(response: reqwest::Response) -> DaemonResult<()> {
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.to_string(),
            };
            return Err(DaemonError::Remote {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> DaemonResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> DaemonResult<()> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> DaemonResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        Self::decode(response).await
    }
}

#[async_trait]
impl NodeDaemon for HttpDaemon {
    async fn init_storage_pool(
        &self,
        pool_id: &str,
        kind: &str,
        config: &serde_json::Value,
    ) -> DaemonResult<PoolInitResult> {
        self.post_json(
            "/api/v1/pools/init",
            &serde_json::json!({
                "poolId": pool_id,
                "type": kind,
                "config": config,
            }),
        )
        .await
    }

    async fn list_pool_files(
        &self,
        pool_id: &str,
        path: &str,
    ) -> DaemonResult<Vec<PoolFileEntry>> {
        let body: FileListBody = self
            .get_json(&format!(
                "/api/v1/pools/{}/files?path={}",
                pool_id,
                urlencode(path)
            ))
            .await?;
        Ok(body.entries)
    }

    async fn start_vm(&self, vm: &VirtualMachine) -> DaemonResult<DaemonVmStatus> {
        self.post_json(&format!("/api/v1/vms/{}/start", vm.id), vm).await
    }

    async fn stop_vm(&self, vm_id: &str, graceful: bool) -> DaemonResult<()> {
        self.post_unit(
            &format!("/api/v1/vms/{}/stop", vm_id),
            &serde_json::json!({ "graceful": graceful }),
        )
        .await
    }

    async fn restart_vm(&self, vm_id: &str) -> DaemonResult<()> {
        self.post_unit(&format!("/api/v1/vms/{}/restart", vm_id), &serde_json::json!({}))
            .await
    }

    async fn pause_vm(&self, vm_id: &str) -> DaemonResult<()> {
        self.post_unit(&format!("/api/v1/vms/{}/pause", vm_id), &serde_json::json!({}))
            .await
    }

    async fn resume_vm(&self, vm_id: &str) -> DaemonResult<()> {
        self.post_unit(&format!("/api/v1/vms/{}/resume", vm_id), &serde_json::json!({}))
            .await
    }

    async fn migrate_vm(&self, vm_id: &str, target_addr: &str) -> DaemonResult<()> {
        self.post_unit(
            &format!("/api/v1/vms/{}/migrate", vm_id),
            &serde_json::json!({ "targetAddr": target_addr }),
        )
        .await
    }

    async fn get_vm_status(&self, vm_id: &str) -> DaemonResult<DaemonVmStatus> {
        self.get_json(&format!("/api/v1/vms/{}/status", vm_id)).await
    }

    async fn list_vm_snapshots(&self, vm_id: &str) -> DaemonResult<Vec<DaemonSnapshot>> {
        self.get_json(&format!("/api/v1/vms/{}/snapshots", vm_id)).await
    }

    async fn create_snapshot(
        &self,
        vm_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> DaemonResult<DaemonSnapshot> {
        self.post_json(
            &format!("/api/v1/vms/{}/snapshots", vm_id),
            &serde_json::json!({ "name": name, "parentId": parent_id }),
        )
        .await
    }

    async fn delete_snapshot(&self, vm_id: &str, snapshot_id: &str) -> DaemonResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/api/v1/vms/{}/snapshots/{}", vm_id, snapshot_id)))
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn revert_snapshot(&self, vm_id: &str, snapshot_id: &str) -> DaemonResult<()> {
        self.post_unit(
            &format!("/api/v1/vms/{}/snapshots/{}/revert", vm_id, snapshot_id),
            &serde_json::json!({}),
        )
        .await
    }

    async fn start_image_download(&self, req: &DownloadRequest) -> DaemonResult<String> {
        let body: DownloadStartedBody = self.post_json("/api/v1/images/download", req).await?;
        Ok(body.job_id)
    }

    async fn get_download_status(
        &self,
        remote_job_id: &str,
    ) -> DaemonResult<RemoteDownloadStatus> {
        self.get_json(&format!("/api/v1/images/download/{}", remote_job_id))
            .await
    }
}

/// Minimal percent-encoding for path query values.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Connector producing [`HttpDaemon`] clients; the production wiring for
/// [`crate::DaemonPool`].
pub struct HttpConnector;

impl DaemonConnector for HttpConnector {
    fn connect(&self, _node_id: &str, addr: &str) -> DaemonResult<std::sync::Arc<dyn NodeDaemon>> {
        Ok(std::sync::Arc::new(HttpDaemon::new(addr)?))
    }
}
