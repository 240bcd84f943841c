/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! AWS Signature Version 4: query presigning for the signaling socket URL and
//! header signing for control-plane requests.

use std::fmt;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use http::{HeaderMap, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};
use url::Url;

use crate::error::{SignalingError, SignalingResult};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SERVICE: &str = "kinesisvideo";
pub const PRESIGN_EXPIRES_SECS: u32 = 299;

const AMZ_DATE: &[FormatItem<'static>] = format_description!("[year][month][day]T[hour][minute][second]Z");
const SCOPE_DATE: &[FormatItem<'static>] = format_description!("[year][month][day]");

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketUrlParams {
    pub channel_arn: String,
    pub client_id: Option<String>,
}

#[async_trait]
pub trait SocketUrlSigner: Send + Sync {
    async fn build_signed_socket_url(
        &self,
        region: &str,
        credentials: &Credentials,
        endpoint: &str,
        params: &SocketUrlParams,
    ) -> SignalingResult<Url>;
}

#[derive(Debug, Clone)]
pub struct SigV4Presigner {
    expires_secs: u32,
}

impl Default for SigV4Presigner {
    fn default() -> Self {
        Self { expires_secs: PRESIGN_EXPIRES_SECS }
    }
}

impl SigV4Presigner {
    pub fn presign_at(
        &self,
        region: &str,
        credentials: &Credentials,
        endpoint: &str,
        params: &SocketUrlParams,
        now: OffsetDateTime,
    ) -> SignalingResult<Url> {
        let url = Url::parse(endpoint).map_err(|e| SignalingError::Signing(format!("bad endpoint {endpoint}: {e}")))?;
        let host = host_header(&url)?;
        let path = canonical_path(&url);
        let (amz_date, scope_date) = stamp(now)?;
        let scope = format!("{scope_date}/{region}/{SERVICE}/aws4_request");

        let mut query: Vec<(String, String)> = vec![("X-Amz-ChannelARN".into(), params.channel_arn.clone())];
        if let Some(id) = params.client_id.as_deref() {
            query.push(("X-Amz-ClientId".into(), id.to_string()));
        }
        query.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
        query.push(("X-Amz-Credential".into(), format!("{}/{scope}", credentials.access_key_id)));
        query.push(("X-Amz-Date".into(), amz_date.clone()));
        query.push(("X-Amz-Expires".into(), self.expires_secs.to_string()));
        if let Some(token) = credentials.session_token.as_deref() {
            query.push(("X-Amz-Security-Token".into(), token.to_string()));
        }
        query.push(("X-Amz-SignedHeaders".into(), "host".into()));
        let canonical_query = canonical_query(&query);

        let canonical_request = format!(
            "GET\n{path}\n{canonical_query}\nhost:{host}\n\nhost\n{}",
            sha256_hex(b"")
        );
        let signature = sign(credentials, &scope_date, region, &amz_date, &scope, &canonical_request)?;

        let signed = format!(
            "{}://{host}{path}?{canonical_query}&X-Amz-Signature={signature}",
            url.scheme()
        );
        Url::parse(&signed).map_err(|e| SignalingError::Signing(e.to_string()))
    }
}

#[async_trait]
impl SocketUrlSigner for SigV4Presigner {
    async fn build_signed_socket_url(
        &self,
        region: &str,
        credentials: &Credentials,
        endpoint: &str,
        params: &SocketUrlParams,
    ) -> SignalingResult<Url> {
        self.presign_at(region, credentials, endpoint, params, OffsetDateTime::now_utc())
    }
}

/// Signs a JSON POST for the control plane. Returns the headers to attach.
pub fn sign_json_post(
    credentials: &Credentials,
    region: &str,
    url: &Url,
    body: &[u8],
    now: OffsetDateTime,
) -> SignalingResult<HeaderMap> {
    let (amz_date, _) = stamp(now)?;
    let mut headers: Vec<(String, String)> = vec![
        ("content-type".into(), "application/json".into()),
        ("host".into(), host_header(url)?),
        ("x-amz-date".into(), amz_date),
    ];
    if let Some(token) = credentials.session_token.as_deref() {
        headers.push(("x-amz-security-token".into(), token.to_string()));
    }
    let authorization = authorization(credentials, region, SERVICE, &Method::POST, url, &headers, body, now)?;
    headers.push(("authorization".into(), authorization));

    let mut out = HeaderMap::new();
    for (name, value) in headers {
        // reqwest derives Host from the URL.
        if name == "host" {
            continue;
        }
        let name = http::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| SignalingError::Signing(e.to_string()))?;
        let value = HeaderValue::from_str(&value).map_err(|e| SignalingError::Signing(e.to_string()))?;
        out.insert(name, value);
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
fn authorization(
    credentials: &Credentials,
    region: &str,
    service: &str,
    method: &Method,
    url: &Url,
    headers: &[(String, String)],
    body: &[u8],
    now: OffsetDateTime,
) -> SignalingResult<String> {
    let (amz_date, scope_date) = stamp(now)?;
    let scope = format!("{scope_date}/{region}/{service}/aws4_request");

    let mut sorted: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    sorted.sort();
    let canonical_headers: String = sorted.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
    let signed_headers = sorted.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(";");

    let query: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    let canonical_request = format!(
        "{}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{}",
        method.as_str(),
        canonical_path(url),
        canonical_query(&query),
        sha256_hex(body)
    );
    let signature = sign_with_service(credentials, &scope_date, region, service, &amz_date, &scope, &canonical_request)?;
    Ok(format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    ))
}

fn sign(
    credentials: &Credentials,
    scope_date: &str,
    region: &str,
    amz_date: &str,
    scope: &str,
    canonical_request: &str,
) -> SignalingResult<String> {
    sign_with_service(credentials, scope_date, region, SERVICE, amz_date, scope, canonical_request)
}

fn sign_with_service(
    credentials: &Credentials,
    scope_date: &str,
    region: &str,
    service: &str,
    amz_date: &str,
    scope: &str,
    canonical_request: &str,
) -> SignalingResult<String> {
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );
    let key = signing_key(&credentials.secret_access_key, scope_date, region, service)?;
    Ok(hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?))
}

pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> SignalingResult<Vec<u8>> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> SignalingResult<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|e| SignalingError::Signing(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn stamp(now: OffsetDateTime) -> SignalingResult<(String, String)> {
    let now = now.to_offset(time::UtcOffset::UTC);
    let amz = now.format(AMZ_DATE).map_err(|e| SignalingError::Signing(e.to_string()))?;
    let day = now.format(SCOPE_DATE).map_err(|e| SignalingError::Signing(e.to_string()))?;
    Ok((amz, day))
}

fn host_header(url: &Url) -> SignalingResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| SignalingError::Signing(format!("endpoint has no host: {url}")))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn canonical_path(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn canonical_query(pairs: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn example_credentials() -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn derives_documented_signing_key() {
        let key = signing_key("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY", "20150830", "us-east-1", "iam").unwrap();
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn matches_get_vanilla_vector() {
        let url = Url::parse("https://example.amazonaws.com/").unwrap();
        let headers = vec![
            ("host".to_string(), "example.amazonaws.com".to_string()),
            ("x-amz-date".to_string(), "20150830T123600Z".to_string()),
        ];
        let auth = authorization(
            &example_credentials(),
            "us-east-1",
            "service",
            &Method::GET,
            &url,
            &headers,
            b"",
            datetime!(2015-08-30 12:36:00 UTC),
        )
        .unwrap();
        assert_eq!(
            auth,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
             SignedHeaders=host;x-amz-date, \
             Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn presigned_socket_url_shape() {
        let mut creds = example_credentials();
        creds.session_token = Some("tok/en+1".to_string());
        let params = SocketUrlParams {
            channel_arn: "arn:aws:kinesisvideo:us-west-2:123456789012:channel/demo/1".to_string(),
            client_id: Some("viewer-1".to_string()),
        };
        let url = SigV4Presigner::default()
            .presign_at(
                "us-west-2",
                &creds,
                "wss://v-1a2b.kinesisvideo.us-west-2.amazonaws.com",
                &params,
                datetime!(2024-01-02 03:04:05 UTC),
            )
            .unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("v-1a2b.kinesisvideo.us-west-2.amazonaws.com"));
        let q: std::collections::HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(q["X-Amz-ChannelARN"], params.channel_arn);
        assert_eq!(q["X-Amz-ClientId"], "viewer-1");
        assert_eq!(q["X-Amz-Algorithm"], "AWS4-HMAC-SHA256");
        assert_eq!(q["X-Amz-Credential"], "AKIDEXAMPLE/20240102/us-west-2/kinesisvideo/aws4_request");
        assert_eq!(q["X-Amz-Date"], "20240102T030405Z");
        assert_eq!(q["X-Amz-Expires"], "299");
        assert_eq!(q["X-Amz-Security-Token"], "tok/en+1");
        assert_eq!(q["X-Amz-SignedHeaders"], "host");
        assert_eq!(q["X-Amz-Signature"].len(), 64);
        assert!(url.as_str().ends_with(&format!("&X-Amz-Signature={}", q["X-Amz-Signature"])));
    }

    #[test]
    fn presign_is_deterministic_and_bound_to_client_id() {
        let at = datetime!(2024-01-02 03:04:05 UTC);
        let signer = SigV4Presigner::default();
        let mut params = SocketUrlParams { channel_arn: "arn:x".to_string(), client_id: None };
        let a = signer.presign_at("us-east-1", &example_credentials(), "ws://127.0.0.1:9000", &params, at).unwrap();
        let b = signer.presign_at("us-east-1", &example_credentials(), "ws://127.0.0.1:9000", &params, at).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.port(), Some(9000));
        assert!(!a.query_pairs().any(|(k, _)| k == "X-Amz-ClientId"));

        params.client_id = Some("v2".to_string());
        let c = signer.presign_at("us-east-1", &example_credentials(), "ws://127.0.0.1:9000", &params, at).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn json_post_headers() {
        let url = Url::parse("https://kinesisvideo.us-west-2.amazonaws.com/getSignalingChannelEndpoint").unwrap();
        let headers = sign_json_post(&example_credentials(), "us-west-2", &url, b"{}", datetime!(2024-01-02 03:04:05 UTC)).unwrap();
        assert_eq!(headers["x-amz-date"], "20240102T030405Z");
        let auth = headers["authorization"].to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240102/us-west-2/kinesisvideo/aws4_request"));
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-date"));
        assert!(!headers.contains_key("host"));
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let shown = format!("{:?}", example_credentials());
        assert!(!shown.contains("EXAMPLEKEY"));
        assert!(shown.contains("AKIDEXAMPLE"));
    }
}
