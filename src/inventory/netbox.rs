//! Netbox implementation of [`Inventory`].
//!
//! `reconcile` looks the VM up by name, then either creates it or patches the
//! existing record. A record that vanishes between lookup and patch is
//! recreated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::client::{Inventory, InventoryError};
use crate::config::InventorySettings;
use crate::event::VmEvent;

const STATUS_PATH: &str = "api/status/";
const VM_PATH: &str = "api/virtualization/virtual-machines/";

#[derive(Debug, Deserialize)]
struct VmList {
    results: Vec<VmRecord>,
}

#[derive(Debug, Deserialize)]
struct VmRecord {
    id: u64,
}

/// HTTP client for the Netbox virtualization API.
#[derive(Clone)]
pub struct NetboxClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    connected: Arc<AtomicBool>,
}

impl NetboxClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            token: token.into(),
            client,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_settings(settings: &InventorySettings) -> Self {
        Self::new(
            settings.url.clone(),
            settings.token.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(ACCEPT, "application/json")
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<Response, InventoryError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| InventoryError::Transient {
                message: format!("{action} request failed: {e}"),
            })
    }

    /// A 404 on the lookup means the VM does not exist yet.
    async fn find_vm(&self, hostname: &str) -> Result<Option<u64>, InventoryError> {
        let request = self.client.get(self.url(VM_PATH)).query(&[("name", hostname)]);
        let response = self.send(request, "lookup").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "lookup").await?;

        let list: VmList = response
            .json()
            .await
            .map_err(|e| InventoryError::Transient {
                message: format!("invalid lookup response: {e}"),
            })?;
        Ok(list.results.first().map(|vm| vm.id))
    }

    async fn create_vm(&self, body: &Map<String, Value>) -> Result<(), InventoryError> {
        let request = self.client.post(self.url(VM_PATH)).json(body);
        let response = self.send(request, "create").await?;
        check_status(response, "create").await?;
        Ok(())
    }

    /// Returns `false` when the record no longer exists.
    async fn update_vm(&self, id: u64, body: &Map<String, Value>) -> Result<bool, InventoryError> {
        let request = self
            .client
            .patch(self.url(&format!("{VM_PATH}{id}/")))
            .json(body);
        let response = self.send(request, "update").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response, "update").await?;
        Ok(true)
    }
}

impl std::fmt::Debug for NetboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetboxClient")
            .field("base_url", &self.base_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[async_trait]
impl Inventory for NetboxClient {
    async fn connect(&self) -> Result<(), InventoryError> {
        let request = self.client.get(self.url(STATUS_PATH));
        let response = self.send(request, "status").await?;
        check_status(response, "status").await?;

        self.connected.store(true, Ordering::SeqCst);
        info!(url = %self.base_url, "connected to inventory service");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconcile(&self, event: &VmEvent) -> Result<(), InventoryError> {
        if !self.is_connected() {
            return Err(InventoryError::NotConnected);
        }

        let body = request_body(event);

        if let Some(id) = self.find_vm(&event.hostname).await? {
            if self.update_vm(id, &body).await? {
                debug!(hostname = %event.hostname, id, "updated virtual machine");
                return Ok(());
            }
            debug!(hostname = %event.hostname, id, "virtual machine vanished, recreating");
        }

        self.create_vm(&body).await?;
        debug!(hostname = %event.hostname, "created virtual machine");
        Ok(())
    }
}

/// The inventory fields of the event with `name` forced to the hostname.
fn request_body(event: &VmEvent) -> Map<String, Value> {
    let mut body = event.fields.clone();
    body.insert("name".to_string(), Value::String(event.hostname.clone()));
    body
}

async fn check_status(response: Response, action: &str) -> Result<Response, InventoryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);
    let message = format!("{action} failed ({status}): {detail}");

    if is_transient_status(status) {
        Err(InventoryError::Transient { message })
    } else {
        Err(InventoryError::Permanent { message })
    }
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}
