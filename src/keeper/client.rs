//! Monitor client
//!
//! [`MonitorApi`] is the keeper's view of the monitor. [`HttpMonitorClient`]
//! speaks the JSON API and also carries the administrative calls used by the
//! CLI; [`MonitorService`] implements the trait directly for in-process use.

use crate::common::error::{Error, Result};
use crate::common::protocol::{
    ErrorBody, FormationStatus, GroupId, NodeId, NodeSettings, NodeStatus, RegisterRequest,
    RegisterResponse, ReportRequest, ReportResponse, StandbyNames,
};
use crate::monitor::events::Event;
use crate::monitor::service::MonitorService;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait MonitorApi: Send + Sync {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse>;

    async fn report(&self, req: ReportRequest) -> Result<ReportResponse>;
}

#[async_trait]
impl MonitorApi for MonitorService {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        MonitorService::register(self, req).await
    }

    async fn report(&self, req: ReportRequest) -> Result<ReportResponse> {
        MonitorService::report(self, req).await
    }
}

#[async_trait]
impl<T: MonitorApi + ?Sized> MonitorApi for Arc<T> {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        (**self).register(req).await
    }

    async fn report(&self, req: ReportRequest) -> Result<ReportResponse> {
        (**self).report(req).await
    }
}

#[derive(Clone)]
pub struct HttpMonitorClient {
    base_url: String,
    client: Client,
}

#[derive(Deserialize)]
struct FormationList {
    formations: Vec<String>,
}

impl HttpMonitorClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send and map non-2xx answers back onto [`Error`].
    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let resp = request.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => Err(Error::from_wire(&body.code, body.error, body.node_id)),
            Err(_) => Err(Error::Http(format!("monitor answered {}: {}", status, text))),
        }
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = self.send(request).await?;
        resp.json()
            .await
            .map_err(|e| Error::Http(format!("invalid monitor response: {}", e)))
    }

    pub async fn drop_node(&self, node_id: NodeId) -> Result<()> {
        let request = self.client.delete(self.url(&format!("/v1/nodes/{}", node_id)));
        self.send(request).await.map(|_| ())
    }

    pub async fn set_node_settings(
        &self,
        node_id: NodeId,
        settings: &NodeSettings,
    ) -> Result<NodeStatus> {
        let request = self
            .client
            .put(self.url(&format!("/v1/nodes/{}/settings", node_id)))
            .json(settings);
        self.json(request).await
    }

    pub async fn enable_maintenance(&self, node_id: NodeId) -> Result<()> {
        let request = self
            .client
            .post(self.url(&format!("/v1/nodes/{}/maintenance", node_id)));
        self.send(request).await.map(|_| ())
    }

    pub async fn disable_maintenance(&self, node_id: NodeId) -> Result<()> {
        let request = self
            .client
            .delete(self.url(&format!("/v1/nodes/{}/maintenance", node_id)));
        self.send(request).await.map(|_| ())
    }

    pub async fn switchover(&self, formation: &str, group_id: GroupId) -> Result<()> {
        let request = self.client.post(self.url(&format!(
            "/v1/formations/{}/groups/{}/switchover",
            formation, group_id
        )));
        let resp = self.send(request).await?;
        if resp.status() != StatusCode::ACCEPTED {
            tracing::debug!(status = %resp.status(), "Unexpected switchover status");
        }
        Ok(())
    }

    pub async fn list_formations(&self) -> Result<Vec<String>> {
        let list: FormationList = self.json(self.client.get(self.url("/v1/formations"))).await?;
        Ok(list.formations)
    }

    pub async fn create_formation(&self, name: &str) -> Result<()> {
        let request = self
            .client
            .post(self.url("/v1/formations"))
            .json(&json!({ "name": name }));
        self.send(request).await.map(|_| ())
    }

    pub async fn drop_formation(&self, name: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.url(&format!("/v1/formations/{}", name)));
        self.send(request).await.map(|_| ())
    }

    pub async fn formation_state(&self, formation: &str) -> Result<FormationStatus> {
        let request = self
            .client
            .get(self.url(&format!("/v1/formations/{}/state", formation)));
        self.json(request).await
    }

    pub async fn standby_names(&self, formation: &str, group_id: GroupId) -> Result<StandbyNames> {
        let request = self.client.get(self.url(&format!(
            "/v1/formations/{}/groups/{}/standby-names",
            formation, group_id
        )));
        self.json(request).await
    }

    pub async fn events(&self, formation: &str, count: usize) -> Result<Vec<Event>> {
        let request = self
            .client
            .get(self.url(&format!("/v1/formations/{}/events", formation)))
            .query(&[("count", count)]);
        self.json(request).await
    }
}

#[async_trait]
impl MonitorApi for HttpMonitorClient {
    async fn register(&self, req: RegisterRequest) -> Result<RegisterResponse> {
        let request = self.client.post(self.url("/v1/nodes")).json(&req);
        self.json(request).await
    }

    async fn report(&self, req: ReportRequest) -> Result<ReportResponse> {
        let request = self
            .client
            .post(self.url(&format!("/v1/nodes/{}/report", req.node_id)))
            .json(&req);
        self.json(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = HttpMonitorClient::new("http://monitor:6000/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://monitor:6000");
        assert_eq!(client.url("/v1/nodes"), "http://monitor:6000/v1/nodes");
    }

    #[tokio::test]
    async fn test_unreachable_monitor_is_retryable() {
        // nothing listens on port 9 of localhost in test environments
        let client = HttpMonitorClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = client.list_formations().await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);
    }
}
