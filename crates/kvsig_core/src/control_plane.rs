/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Signaling channel control plane: endpoint resolution and ICE server
//! configuration.

use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};
use url::Url;

use crate::error::{SignalingError, SignalingResult};
use crate::role::Role;
use crate::sigv4::{sign_json_post, Credentials};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub wss: Option<String>,
    pub https: Option<String>,
    pub webrtc: Option<String>,
}

#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve_endpoints(&self, region: &str, channel_arn: &str, role: Role) -> SignalingResult<Endpoints>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[async_trait]
pub trait IceServerSource: Send + Sync {
    async fn ice_servers(
        &self,
        region: &str,
        channel_arn: &str,
        role: Role,
        client_id: Option<&str>,
    ) -> SignalingResult<Vec<IceServer>>;
}

pub fn default_stun(region: &str) -> IceServer {
    IceServer {
        urls: vec![format!("stun:stun.kinesisvideo.{region}.amazonaws.com:443")],
        username: None,
        credential: None,
    }
}

/// Fixed endpoints, for wiring a session to a known relay.
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints(pub Endpoints);

#[async_trait]
impl EndpointResolver for StaticEndpoints {
    async fn resolve_endpoints(&self, _region: &str, _channel_arn: &str, _role: Role) -> SignalingResult<Endpoints> {
        Ok(self.0.clone())
    }
}

#[async_trait]
impl IceServerSource for StaticEndpoints {
    async fn ice_servers(
        &self,
        region: &str,
        _channel_arn: &str,
        _role: Role,
        _client_id: Option<&str>,
    ) -> SignalingResult<Vec<IceServer>> {
        Ok(vec![default_stun(region)])
    }
}

#[derive(Clone)]
pub struct KinesisControlPlane {
    http: reqwest::Client,
    credentials: Credentials,
    endpoint_override: Option<Url>,
    attempts: u32,
}

impl KinesisControlPlane {
    pub fn new(credentials: Credentials, timeout: Duration) -> SignalingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalingError::ControlPlane(e.to_string()))?;
        Ok(Self { http, credentials, endpoint_override: None, attempts: 3 })
    }

    /// Sends control-plane calls to `url` instead of the regional AWS host.
    pub fn with_endpoint_override(mut self, url: Url) -> Self {
        self.endpoint_override = Some(url);
        self
    }

    fn control_url(&self, region: &str) -> SignalingResult<Url> {
        match &self.endpoint_override {
            Some(u) => Ok(u.clone()),
            None => Url::parse(&format!("https://kinesisvideo.{region}.amazonaws.com"))
                .map_err(|e| SignalingError::ControlPlane(e.to_string())),
        }
    }

    async fn post_json<B, R>(&self, region: &str, url: Url, body: &B) -> SignalingResult<R>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        let bytes = serde_json::to_vec(body).map_err(|e| SignalingError::ControlPlane(e.to_string()))?;
        let headers = sign_json_post(&self.credentials, region, &url, &bytes, OffsetDateTime::now_utc())?;
        let resp = send_with_retry(
            || self.http.post(url.clone()).headers(headers.clone()).body(bytes.clone()),
            self.attempts,
        )
        .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(SignalingError::ControlPlane(format!("{url} returned {status}: {text}")));
        }
        resp.json::<R>()
            .await
            .map_err(|e| SignalingError::ControlPlane(format!("decode response from {url}: {e}")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetEndpointRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    single_master_channel_endpoint_configuration: EndpointConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointConfiguration<'a> {
    protocols: [&'static str; 2],
    role: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetEndpointResponse {
    #[serde(default)]
    resource_endpoint_list: Vec<ResourceEndpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceEndpoint {
    protocol: String,
    resource_endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct GetIceServerConfigRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    service: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetIceServerConfigResponse {
    #[serde(default)]
    ice_server_list: Vec<KinesisIceServer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KinesisIceServer {
    #[serde(default)]
    uris: Vec<String>,
    username: Option<String>,
    password: Option<String>,
}

fn endpoints_from(list: Vec<ResourceEndpoint>) -> Endpoints {
    let mut out = Endpoints::default();
    for e in list {
        match e.protocol.to_ascii_uppercase().as_str() {
            "WSS" => out.wss = Some(e.resource_endpoint),
            "HTTPS" => out.https = Some(e.resource_endpoint),
            "WEBRTC" => out.webrtc = Some(e.resource_endpoint),
            other => debug!(protocol=%other, "ignoring unknown endpoint protocol"),
        }
    }
    out
}

#[async_trait]
impl EndpointResolver for KinesisControlPlane {
    async fn resolve_endpoints(&self, region: &str, channel_arn: &str, role: Role) -> SignalingResult<Endpoints> {
        let url = self
            .control_url(region)?
            .join("getSignalingChannelEndpoint")
            .map_err(|e| SignalingError::ControlPlane(e.to_string()))?;
        let body = GetEndpointRequest {
            channel_arn,
            single_master_channel_endpoint_configuration: EndpointConfiguration {
                protocols: ["WSS", "HTTPS"],
                role: role.as_str(),
            },
        };
        let resp: GetEndpointResponse = self.post_json(region, url, &body).await?;
        let endpoints = endpoints_from(resp.resource_endpoint_list);
        debug!(wss=?endpoints.wss, https=?endpoints.https, "resolved signaling endpoints");
        Ok(endpoints)
    }
}

#[async_trait]
impl IceServerSource for KinesisControlPlane {
    async fn ice_servers(
        &self,
        region: &str,
        channel_arn: &str,
        role: Role,
        client_id: Option<&str>,
    ) -> SignalingResult<Vec<IceServer>> {
        let mut servers = vec![default_stun(region)];
        let endpoints = self.resolve_endpoints(region, channel_arn, role).await?;
        let Some(https) = endpoints.https else {
            warn!("no HTTPS endpoint; using STUN only");
            return Ok(servers);
        };
        let url = Url::parse(&https)
            .and_then(|u| u.join("v1/get-ice-server-config"))
            .map_err(|e| SignalingError::ControlPlane(e.to_string()))?;
        let body = GetIceServerConfigRequest { channel_arn, client_id, service: "TURN" };
        let resp: GetIceServerConfigResponse = self.post_json(region, url, &body).await?;
        servers.extend(resp.ice_server_list.into_iter().map(|s| IceServer {
            urls: s.uris,
            username: s.username,
            credential: s.password,
        }));
        Ok(servers)
    }
}

async fn send_with_retry<F>(mut build: F, attempts: u32) -> SignalingResult<Response>
where
    F: FnMut() -> RequestBuilder,
{
    let max_attempts = attempts.clamp(1, 5);
    let mut backoff = Duration::from_millis(200);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match build().send().await {
            Ok(resp) => {
                if should_retry_status(resp.status()) && attempt < max_attempts {
                    sleep_with_jitter(backoff).await;
                    backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
                    continue;
                }
                return Ok(resp);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(SignalingError::ControlPlane(e.to_string()));
                }
                sleep_with_jitter(backoff).await;
                backoff = backoff.saturating_mul(2).min(Duration::from_secs(5));
            }
        }
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

async fn sleep_with_jitter(base: Duration) {
    let jitter_ms: u64 = thread_rng().gen_range(0..=200);
    tokio::time::sleep(base + Duration::from_millis(jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_request_body_shape() {
        let body = GetEndpointRequest {
            channel_arn: "arn:c",
            single_master_channel_endpoint_configuration: EndpointConfiguration {
                protocols: ["WSS", "HTTPS"],
                role: Role::Viewer.as_str(),
            },
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "ChannelARN": "arn:c",
                "SingleMasterChannelEndpointConfiguration": {"Protocols": ["WSS", "HTTPS"], "Role": "VIEWER"}
            })
        );
    }

    #[test]
    fn endpoint_list_maps_protocols() {
        let resp: GetEndpointResponse = serde_json::from_value(serde_json::json!({
            "ResourceEndpointList": [
                {"Protocol": "HTTPS", "ResourceEndpoint": "https://r-1.kinesisvideo.us-west-2.amazonaws.com"},
                {"Protocol": "WSS", "ResourceEndpoint": "wss://m-1.kinesisvideo.us-west-2.amazonaws.com"}
            ]
        }))
        .unwrap();
        let e = endpoints_from(resp.resource_endpoint_list);
        assert_eq!(e.wss.as_deref(), Some("wss://m-1.kinesisvideo.us-west-2.amazonaws.com"));
        assert_eq!(e.https.as_deref(), Some("https://r-1.kinesisvideo.us-west-2.amazonaws.com"));
        assert_eq!(e.webrtc, None);
    }

    #[test]
    fn missing_wss_is_left_empty() {
        let resp: GetEndpointResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(endpoints_from(resp.resource_endpoint_list), Endpoints::default());
    }

    #[test]
    fn stun_url_is_regional() {
        assert_eq!(
            default_stun("eu-central-1").urls,
            vec!["stun:stun.kinesisvideo.eu-central-1.amazonaws.com:443".to_string()]
        );
    }

    #[test]
    fn retries_only_throttling_and_server_errors() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::BAD_GATEWAY));
        assert!(!should_retry_status(StatusCode::FORBIDDEN));
    }
}
