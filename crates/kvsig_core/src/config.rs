/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kvsig_protocol::PayloadEncoding;
use serde::{Deserialize, Serialize};

use crate::role::Role;
use crate::sigv4::Credentials;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub region: String,
    pub channel_arn: String,
    #[serde(default)]
    pub role: Role,
    /// Required for `VIEWER`; ignored for `MASTER`.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub credentials: Credentials,
    /// Viewer sends its offer as soon as the socket opens.
    #[serde(default = "default_true")]
    pub auto_offer: bool,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    /// Control-plane base URL override (e.g. a local `kvsig_relay`).
    #[serde(default)]
    pub control_plane_url: Option<String>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            region: "us-west-2".to_string(),
            channel_arn: String::new(),
            role: Role::Master,
            client_id: None,
            credentials: Credentials::default(),
            auto_offer: true,
            payload_encoding: PayloadEncoding::Plain,
            control_plane_url: None,
            http_timeout_secs: None,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SessionConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: SessionConfig =
            serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
        cfg.fill_credentials_from_env();
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let defaults = SessionConfig::default();
        let role = match env_opt("KVSIG_ROLE") {
            Some(r) => Role::parse(&r).ok_or_else(|| anyhow!("KVSIG_ROLE must be MASTER or VIEWER, got {r}"))?,
            None => defaults.role,
        };
        let payload_encoding = match env_opt("KVSIG_PAYLOAD_ENCODING").as_deref() {
            None | Some("plain") => PayloadEncoding::Plain,
            Some("base64") => PayloadEncoding::Base64,
            Some(other) => return Err(anyhow!("KVSIG_PAYLOAD_ENCODING must be plain or base64, got {other}")),
        };
        let mut cfg = SessionConfig {
            region: env_opt("KVSIG_REGION").unwrap_or(defaults.region),
            channel_arn: env_opt("KVSIG_CHANNEL_ARN").context("KVSIG_CHANNEL_ARN is not set")?,
            role,
            client_id: env_opt("KVSIG_CLIENT_ID"),
            credentials: Credentials::default(),
            auto_offer: env_opt("KVSIG_AUTO_OFFER")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
                .unwrap_or(true),
            payload_encoding,
            control_plane_url: env_opt("KVSIG_CONTROL_PLANE_URL"),
            http_timeout_secs: env_opt("KVSIG_HTTP_TIMEOUT_SECS")
                .map(|v| v.parse::<u64>().context("KVSIG_HTTP_TIMEOUT_SECS"))
                .transpose()?,
        };
        cfg.fill_credentials_from_env();
        Ok(cfg)
    }

    /// `KVSIG_CONFIG` names a JSON file; otherwise everything comes from `KVSIG_*`.
    pub fn load() -> Result<Self> {
        match env_opt("KVSIG_CONFIG") {
            Some(path) => Self::from_json_file(Path::new(&path)),
            None => Self::from_env(),
        }
    }

    fn fill_credentials_from_env(&mut self) {
        if self.credentials.access_key_id.is_empty() {
            if let Some(v) = env_opt("AWS_ACCESS_KEY_ID") {
                self.credentials.access_key_id = v;
            }
        }
        if self.credentials.secret_access_key.is_empty() {
            if let Some(v) = env_opt("AWS_SECRET_ACCESS_KEY") {
                self.credentials.secret_access_key = v;
            }
        }
        if self.credentials.session_token.is_none() {
            self.credentials.session_token = env_opt("AWS_SESSION_TOKEN");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"region":"eu-west-1","channel_arn":"arn:c","role":"VIEWER","client_id":"v1"}"#,
        )
        .unwrap();
        assert_eq!(cfg.role, Role::Viewer);
        assert_eq!(cfg.client_id.as_deref(), Some("v1"));
        assert!(cfg.auto_offer);
        assert_eq!(cfg.payload_encoding, PayloadEncoding::Plain);
        assert!(cfg.control_plane_url.is_none());
    }

    #[test]
    fn json_overrides() {
        let cfg: SessionConfig = serde_json::from_str(
            r#"{"region":"eu-west-1","channel_arn":"arn:c","auto_offer":false,"payload_encoding":"base64",
                "credentials":{"access_key_id":"AK","secret_access_key":"SK","session_token":"T"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.role, Role::Master);
        assert!(!cfg.auto_offer);
        assert_eq!(cfg.payload_encoding, PayloadEncoding::Base64);
        assert_eq!(cfg.credentials.session_token.as_deref(), Some("T"));
    }
}
