use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::{GateError, GateResult};

pub const API_BASE: &str = "https://api.weixin.qq.com";
pub const QY_API_BASE: &str = "https://qyapi.weixin.qq.com";
pub const MCH_API_BASE: &str = "https://api.mch.weixin.qq.com";
pub const OPEN_BASE: &str = "https://open.weixin.qq.com";
pub const MP_BASE: &str = "https://mp.weixin.qq.com";

/// Hosts the client talks to. Overridable so tests can point at a mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamHosts {
    pub api_base: String,
    pub qy_api_base: String,
    pub mch_api_base: String,
}

impl Default for UpstreamHosts {
    fn default() -> Self {
        Self {
            api_base: API_BASE.to_string(),
            qy_api_base: QY_API_BASE.to_string(),
            mch_api_base: MCH_API_BASE.to_string(),
        }
    }
}

/// Shared HTTP client for credential and API calls.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    hosts: UpstreamHosts,
    http_client: Client,
}

impl UpstreamClient {
    pub fn new(hosts: UpstreamHosts, timeout: Duration) -> Result<Self> {
        Self::with_identity(hosts, timeout, None)
    }

    /// Client presenting a TLS client certificate, as merchant refunds require.
    pub fn with_identity(
        hosts: UpstreamHosts,
        timeout: Duration,
        identity: Option<reqwest::Identity>,
    ) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        if let Some(identity) = identity {
            builder = builder.identity(identity);
        }
        let http_client = builder.build().context("creating HTTP client")?;

        debug!(api_base = %hosts.api_base, "upstream client initialized");

        Ok(Self { hosts, http_client })
    }

    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.hosts.api_base.trim_end_matches('/'), path)
    }

    pub fn qy_url(&self, path: &str) -> String {
        format!("{}{}", self.hosts.qy_api_base.trim_end_matches('/'), path)
    }

    pub fn mch_url(&self, path: &str) -> String {
        format!("{}{}", self.hosts.mch_api_base.trim_end_matches('/'), path)
    }

    /// GET returning a JSON body with `errcode` already checked.
    pub async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> GateResult<Value> {
        debug!(url = %url, "GET upstream");
        let response = self.http_client.get(url).query(query).send().await?;
        let bytes = read_success(response).await?;
        check_res_error(serde_json::from_slice(&bytes)?)
    }

    /// POST a JSON body, returning the JSON response with `errcode` checked.
    pub async fn post_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> GateResult<Value> {
        debug!(url = %url, "POST upstream");
        let response = self
            .http_client
            .post(url)
            .query(query)
            .json(body)
            .send()
            .await?;
        let bytes = read_success(response).await?;
        check_res_error(serde_json::from_slice(&bytes)?)
    }

    /// POST an XML document and hand back the raw response body.
    pub async fn post_xml(&self, url: &str, xml: String) -> GateResult<Vec<u8>> {
        debug!(url = %url, "POST upstream xml");
        let response = self
            .http_client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(xml)
            .send()
            .await?;
        read_success(response).await
    }
}

async fn read_success(response: reqwest::Response) -> GateResult<Vec<u8>> {
    let status = response.status();
    if !status.is_success() {
        return Err(GateError::Transport(format!(
            "upstream request failed with status {status}"
        )));
    }
    Ok(response.bytes().await?.to_vec())
}

/// Turn a non-zero `errcode` into an error; `errcode` 0 or absent is success.
pub fn check_res_error(value: Value) -> GateResult<Value> {
    let code = value.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(value);
    }
    let message = value
        .get("errmsg")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("errcode: {code}"));
    Err(GateError::from_errcode(code, message))
}

/// Required string field of an upstream JSON response.
pub fn str_field(value: &Value, field: &str) -> GateResult<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GateError::RefreshFailed(format!("failed to parse {field}")))
}

/// `expires_in` of an upstream JSON response; missing counts as zero.
pub fn expires_in(value: &Value) -> i64 {
    value.get("expires_in").and_then(Value::as_i64).unwrap_or(0)
}
