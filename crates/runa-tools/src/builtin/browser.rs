// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Browser tools over the Chrome DevTools Protocol.
//!
//! One shared [`BrowserSession`] owns the chromium process and the active
//! page.  Every action appends a fresh text snapshot of the page to its
//! result, so the model always reasons about the page as it is *after* the
//! action — acting on element references from a pre-action snapshot is the
//! main source of stale-reference cascades.  The agent loop additionally
//! caps browser actions per iteration.

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::policy::ApprovalPolicy;
use crate::state::ExecutionState;
use crate::tool::{Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

const SNAPSHOT_CAP: usize = 20_000;

#[derive(Default)]
struct SessionInner {
    browser: Option<Browser>,
    page: Option<Page>,
}

/// Shared browser state handed to every browser tool.
#[derive(Clone, Default)]
pub struct BrowserSession {
    inner: Arc<RwLock<SessionInner>>,
}

impl BrowserSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch chromium lazily on first use.
    async fn ensure_started(&self) -> Result<(), String> {
        let mut inner = self.inner.write().await;
        if inner.browser.is_some() {
            return Ok(());
        }
        let config = BrowserConfig::builder()
            .build()
            .map_err(|e| format!("browser config: {e}"))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| format!("chromium launch failed: {e}"))?;
        // The CDP event loop must be drained or the connection stalls.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        inner.browser = Some(browser);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<Page, String> {
        self.ensure_started().await?;
        let mut inner = self.inner.write().await;
        let browser = inner.browser.as_mut().expect("started above");
        let page = browser
            .new_page(url)
            .await
            .map_err(|e| format!("navigation failed: {e}"))?;
        let _ = page.wait_for_navigation().await;
        // Close the previous page; one active page per session.
        if let Some(old) = inner.page.take() {
            let _ = old.close().await;
        }
        inner.page = Some(page.clone());
        Ok(page)
    }

    async fn page(&self) -> Result<Page, String> {
        self.inner
            .read()
            .await
            .page
            .clone()
            .ok_or_else(|| "no page open; call browser_navigate first".to_string())
    }

    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        if let Some(page) = inner.page.take() {
            let _ = page.close().await;
        }
        if let Some(mut browser) = inner.browser.take() {
            if let Err(e) = browser.close().await {
                warn!("browser close failed: {e}");
            }
        }
    }
}

/// Text snapshot of the current page: url, title and readable content.
async fn snapshot_text(page: &Page) -> String {
    let url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| "(unknown)".to_string());
    let title = page
        .get_title()
        .await
        .ok()
        .flatten()
        .unwrap_or_default();
    let content = match page.content().await {
        Ok(html) => {
            let mut text = html2text::from_read(html.as_bytes(), 100);
            if text.len() > SNAPSHOT_CAP {
                text.truncate(SNAPSHOT_CAP);
                text.push_str("\n[... snapshot truncated ...]");
            }
            text
        }
        Err(e) => format!("(snapshot failed: {e})"),
    };
    format!("--- page snapshot ---\nurl: {url}\ntitle: {title}\n\n{content}")
}

// ── browser_navigate ─────────────────────────────────────────────────────────

pub struct BrowserNavigateTool {
    pub session: BrowserSession,
    pub state: Arc<ExecutionState>,
}

#[async_trait]
impl Tool for BrowserNavigateTool {
    fn name(&self) -> &str {
        "browser_navigate"
    }

    fn description(&self) -> &str {
        "Open a URL in the managed browser. The result includes a fresh page \
         snapshot; use it (not memory) to decide the next action."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "URL to open" }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Browser
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(url) = call.str_param("url") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'url'",
            );
        };
        debug!(url, "browser_navigate tool");
        match self.session.navigate(url).await {
            Ok(page) => {
                self.state.record_visit(url);
                let snap = snapshot_text(&page).await;
                ToolOutput::ok(call.id, format!("navigated to {url}\n\n{snap}"))
            }
            Err(e) => ToolOutput::err(call.id, ToolErrorKind::ExternalError, e),
        }
    }
}

// ── browser_snapshot ─────────────────────────────────────────────────────────

pub struct BrowserSnapshotTool {
    pub session: BrowserSession,
}

#[async_trait]
impl Tool for BrowserSnapshotTool {
    fn name(&self) -> &str {
        "browser_snapshot"
    }

    fn description(&self) -> &str {
        "Capture a fresh text snapshot of the current page."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "additionalProperties": false})
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Browser
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.session.page().await {
            Ok(page) => ToolOutput::ok(call.id, snapshot_text(&page).await),
            Err(e) => ToolOutput::err(call.id, ToolErrorKind::InvalidParams, e),
        }
    }
}

// ── browser_click ────────────────────────────────────────────────────────────

pub struct BrowserClickTool {
    pub session: BrowserSession,
}

#[async_trait]
impl Tool for BrowserClickTool {
    fn name(&self) -> &str {
        "browser_click"
    }

    fn description(&self) -> &str {
        "Click the first element matching a CSS selector on the current \
         page. The result includes a fresh post-click snapshot."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "selector": {
                    "type": "string",
                    "description": "CSS selector of the element to click"
                }
            },
            "required": ["selector"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Browser
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(selector) = call.str_param("selector") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'selector'",
            );
        };
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call.id, ToolErrorKind::InvalidParams, e),
        };
        let element = match page.find_element(selector).await {
            Ok(el) => el,
            Err(e) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::NotFound,
                    format!("no element matches '{selector}': {e}"),
                )
            }
        };
        if let Err(e) = element.click().await {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("click failed: {e}"),
            );
        }
        let _ = page.wait_for_navigation().await;
        let snap = snapshot_text(&page).await;
        ToolOutput::ok(call.id, format!("clicked '{selector}'\n\n{snap}"))
    }
}

// ── browser_type ─────────────────────────────────────────────────────────────

pub struct BrowserTypeTool {
    pub session: BrowserSession,
}

#[async_trait]
impl Tool for BrowserTypeTool {
    fn name(&self) -> &str {
        "browser_type"
    }

    fn description(&self) -> &str {
        "Type text into the first element matching a CSS selector. The \
         result includes a fresh post-input snapshot."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "selector": {
                    "type": "string",
                    "description": "CSS selector of the input element"
                },
                "text": {
                    "type": "string",
                    "description": "Text to type"
                }
            },
            "required": ["selector", "text"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Browser
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let (Some(selector), Some(text)) = (call.str_param("selector"), call.str_param("text"))
        else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "browser_type requires 'selector' and 'text'",
            );
        };
        let page = match self.session.page().await {
            Ok(p) => p,
            Err(e) => return ToolOutput::err(call.id, ToolErrorKind::InvalidParams, e),
        };
        let element = match page.find_element(selector).await {
            Ok(el) => el,
            Err(e) => {
                return ToolOutput::err(
                    call.id,
                    ToolErrorKind::NotFound,
                    format!("no element matches '{selector}': {e}"),
                )
            }
        };
        let typed = async {
            element.click().await.map_err(|e| e.to_string())?;
            element.type_str(text).await.map_err(|e| e.to_string())?;
            Ok::<(), String>(())
        }
        .await;
        if let Err(e) = typed {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("typing failed: {e}"),
            );
        }
        let snap = snapshot_text(&page).await;
        ToolOutput::ok(call.id, format!("typed into '{selector}'\n\n{snap}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::CallOrigin;
    use serde_json::json;

    // Browser tools are exercised end-to-end only when a chromium binary is
    // available; these tests cover the parameter and no-page paths.

    #[tokio::test]
    async fn snapshot_without_page_is_an_error() {
        let tool = BrowserSnapshotTool {
            session: BrowserSession::new(),
        };
        let out = tool
            .execute(&ToolCall::new("browser_snapshot", json!({}), CallOrigin::Native))
            .await;
        assert!(!out.success);
        assert!(out.output.contains("browser_navigate first"));
    }

    #[tokio::test]
    async fn click_without_selector_is_invalid() {
        let tool = BrowserClickTool {
            session: BrowserSession::new(),
        };
        let out = tool
            .execute(&ToolCall::new("browser_click", json!({}), CallOrigin::Native))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }

    #[tokio::test]
    async fn type_requires_both_params() {
        let tool = BrowserTypeTool {
            session: BrowserSession::new(),
        };
        let out = tool
            .execute(&ToolCall::new(
                "browser_type",
                json!({"selector": "#input"}),
                CallOrigin::Native,
            ))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }

    #[tokio::test]
    async fn navigate_without_url_is_invalid() {
        let tool = BrowserNavigateTool {
            session: BrowserSession::new(),
            state: Arc::new(ExecutionState::new()),
        };
        let out = tool
            .execute(&ToolCall::new("browser_navigate", json!({}), CallOrigin::Native))
            .await;
        assert_eq!(out.error, Some(ToolErrorKind::InvalidParams));
    }
}
