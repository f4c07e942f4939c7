// OpenStack-compatible compute implementation. Three REST calls against
// the Nova-style API: create server, delete server, detailed listing.
// Authentication is a pre-issued token sent as `X-Auth-Token`.

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use fleet_common::error::{FleetError, FleetResult};
use fleet_common::settings::{ComputeSettings, InstanceSettings};
use fleet_common::RUNNER_NAME_PREFIX;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::compute::{ComputeProvider, ServerStatus, ServerSummary};

#[derive(Debug, Serialize)]
struct CreateServerBody<'a> {
    server: CreateServer<'a>,
}

#[derive(Debug, Serialize)]
struct CreateServer<'a> {
    name: &'a str,
    #[serde(rename = "imageRef")]
    image_ref: &'a str,
    #[serde(rename = "flavorRef")]
    flavor_ref: &'a str,
    networks: Vec<NetworkRef<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_name: Option<&'a str>,
    /// Base64-encoded cloud-init document.
    user_data: String,
}

#[derive(Debug, Serialize)]
struct NetworkRef<'a> {
    uuid: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    server: CreatedServer,
}

#[derive(Debug, Deserialize)]
struct CreatedServer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListServersResponse {
    servers: Vec<ListedServer>,
}

#[derive(Debug, Deserialize)]
struct ListedServer {
    id: String,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
}

/// Compute adapter against an OpenStack-compatible endpoint.
pub struct OpenStackCompute {
    http: reqwest::Client,
    endpoint: String,
    auth_token: String,
    network: String,
    key_name: Option<String>,
}

impl OpenStackCompute {
    pub fn new(
        compute: &ComputeSettings,
        instance: &InstanceSettings,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!(
                "runner-fleet-controller/{}",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Url::parse(&compute.endpoint)?;

        Ok(Self {
            http,
            endpoint: compute.endpoint.trim_end_matches('/').to_string(),
            auth_token: compute.auth_token.clone(),
            network: instance.network.clone(),
            key_name: instance.key_name.clone(),
        })
    }

    fn servers_url(&self) -> String {
        format!("{}/servers", self.endpoint)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("X-Auth-Token", &self.auth_token)
            .header(reqwest::header::ACCEPT, "application/json")
    }
}

#[async_trait]
impl ComputeProvider for OpenStackCompute {
    async fn create_server(
        &self,
        name: &str,
        image: &str,
        flavor: &str,
        user_data: &str,
    ) -> FleetResult<String> {
        let body = CreateServerBody {
            server: CreateServer {
                name,
                image_ref: image,
                flavor_ref: flavor,
                networks: vec![NetworkRef {
                    uuid: &self.network,
                }],
                key_name: self.key_name.as_deref(),
                user_data: BASE64_STANDARD.encode(user_data),
            },
        };

        let response = self
            .request(self.http.post(self.servers_url()))
            .json(&body)
            .send()
            .await
            .map_err(FleetError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::from_status(status, &response));
        }

        let created: CreateServerResponse = response
            .json()
            .await
            .map_err(|e| FleetError::InvalidRequest(format!("malformed create response: {e}")))?;

        tracing::info!(name, instance_id = %created.server.id, "created server");
        Ok(created.server.id)
    }

    async fn delete_server(&self, instance_id: &str) -> FleetResult<()> {
        let url = format!("{}/{}", self.servers_url(), instance_id);

        let response = self
            .request(self.http.delete(url))
            .send()
            .await
            .map_err(FleetError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(instance_id, "deleted server");
            return Ok(());
        }

        match FleetError::from_status(status, &response) {
            // Already gone counts as deleted.
            FleetError::NotFound => Ok(()),
            err => Err(err),
        }
    }

    async fn list_servers(&self) -> FleetResult<Vec<ServerSummary>> {
        let url = format!("{}/detail", self.servers_url());

        let response = self
            .request(self.http.get(url))
            .send()
            .await
            .map_err(FleetError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::from_status(status, &response));
        }

        let body: ListServersResponse = response
            .json()
            .await
            .map_err(|e| FleetError::InvalidRequest(format!("malformed server list: {e}")))?;

        let servers: Vec<ServerSummary> = body
            .servers
            .into_iter()
            .filter(|s| s.name.starts_with(RUNNER_NAME_PREFIX))
            .map(|s| ServerSummary {
                status: ServerStatus::parse(&s.status),
                id: s.id,
                name: s.name,
                created_at: s.created,
            })
            .collect();

        tracing::debug!(count = servers.len(), "listed fleet servers");
        Ok(servers)
    }
}
