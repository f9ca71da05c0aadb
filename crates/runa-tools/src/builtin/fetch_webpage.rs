// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::policy::ApprovalPolicy;
use crate::state::ExecutionState;
use crate::tool::{Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

const DEFAULT_BODY_CAP: usize = 200 * 1024;

pub struct FetchWebpageTool {
    pub state: Arc<ExecutionState>,
    pub body_cap_bytes: usize,
}

impl FetchWebpageTool {
    pub fn new(state: Arc<ExecutionState>) -> Self {
        Self {
            state,
            body_cap_bytes: DEFAULT_BODY_CAP,
        }
    }
}

#[async_trait]
impl Tool for FetchWebpageTool {
    fn name(&self) -> &str {
        "fetch_webpage"
    }

    fn description(&self) -> &str {
        "Fetch a webpage and return its content as readable text. \
         HTML is converted to text automatically; the body is capped at \
         200 KB. http/https only; localhost and private addresses are \
         blocked. Read-only — no authentication, no side effects."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch (http or https)"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Web
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(raw_url) = call.str_param("url") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'url'",
            );
        };

        let parsed = match Url::parse(raw_url) {
            Ok(u) => u,
            Err(e) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::InvalidParams,
                    format!("invalid URL: {e}"),
                )
            }
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                format!("unsupported scheme: {}", parsed.scheme()),
            );
        }

        // SSRF guard: resolve the host and reject when ANY address is
        // private.  Checking after DNS resolution (not the hostname string)
        // is the point — `internal.attacker.example` can resolve to 10.0.0.1.
        let Some(host) = parsed.host_str() else {
            return ToolOutput::err(call.id, ToolErrorKind::InvalidParams, "URL has no host");
        };
        let port = parsed.port_or_known_default().unwrap_or(443);
        let addrs = match tokio::net::lookup_host((host, port)).await {
            Ok(a) => a.collect::<Vec<_>>(),
            Err(e) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::ExternalError,
                    format!("DNS resolution failed for {host}: {e}"),
                )
            }
        };
        if addrs.is_empty() {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("{host} did not resolve"),
            );
        }
        if let Some(private) = addrs.iter().find(|a| is_private_addr(a.ip())) {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::DangerousRejected,
                format!("{host} resolves to a private address ({})", private.ip()),
            );
        }

        debug!(url = %parsed, "fetch_webpage tool");

        match fetch_capped(parsed.as_str(), self.body_cap_bytes).await {
            Ok((body, content_type)) => {
                self.state.record_visit(parsed.to_string());
                let text = if content_type.contains("html") {
                    html2text::from_read(body.as_bytes(), 100)
                } else {
                    body
                };
                ToolOutput::ok(call.id, text)
            }
            Err(e) => ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("fetch failed: {e}"),
            ),
        }
    }
}

/// Download at most `cap` bytes of the response body.
async fn fetch_capped(url: &str, cap: usize) -> anyhow::Result<(String, String)> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(20))
        .user_agent("Mozilla/5.0 (compatible; runa-runtime)")
        .build()?;

    let resp = client.get(url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("server returned {}", resp.status());
    }
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("text/plain")
        .to_string();

    let mut body: Vec<u8> = Vec::with_capacity(cap.min(64 * 1024));
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let remaining = cap.saturating_sub(body.len());
        if remaining == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    Ok((String::from_utf8_lossy(&body).into_owned(), content_type))
}

/// Private / loopback / link-local ranges blocked by the SSRF guard.
fn is_private_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // Carrier-grade NAT, 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
