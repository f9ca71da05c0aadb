// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolErrorKind, ToolFamily, ToolOutput};

/// Web search over the DuckDuckGo HTML endpoint.
///
/// Deliberately keyless: the runtime must work offline-first with no account
/// setup, so results are scraped from the plain-HTML interface rather than a
/// metered search API.
pub struct WebSearchTool {
    pub max_results: usize,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self { max_results: 5 }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web and return titles, URLs and snippets of the top \
         results. Use fetch_webpage afterwards to read a specific result. \
         Use for current information that is not in the project."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query"
                },
                "count": {
                    "type": "integer",
                    "description": "Number of results (default 5, max 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    fn family(&self) -> ToolFamily {
        ToolFamily::Web
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let Some(query) = call.str_param("query") else {
            return ToolOutput::err(
                call.id,
                ToolErrorKind::InvalidParams,
                "missing required parameter 'query'",
            );
        };
        let count = call
            .u64_param("count")
            .map(|c| c as usize)
            .unwrap_or(self.max_results)
            .min(10);

        debug!(query, count, "web_search tool");

        match html_search(query, count).await {
            Ok(results) if results.is_empty() => ToolOutput::ok(call.id, "(no results)"),
            Ok(results) => ToolOutput::ok(call.id, results),
            Err(e) => ToolOutput::err(
                call.id,
                ToolErrorKind::ExternalError,
                format!("search failed: {e}"),
            ),
        }
    }
}

async fn html_search(query: &str, count: usize) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .user_agent("Mozilla/5.0 (compatible; runa-runtime)")
        .build()?;

    let resp = client
        .get("https://html.duckduckgo.com/html/")
        .query(&[("q", query)])
        .send()
        .await?;
    if !resp.status().is_success() {
        anyhow::bail!("search endpoint returned {}", resp.status());
    }
    let html = resp.text().await?;
    Ok(parse_results(&html, count))
}

/// Pull result anchors and snippets out of the HTML results page.
fn parse_results(html: &str, count: usize) -> String {
    let anchor =
        regex::Regex::new(r#"<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#)
            .expect("static regex");
    let snippet = regex::Regex::new(r#"(?s)<a[^>]*class="result__snippet"[^>]*>(.*?)</a>"#)
        .expect("static regex");

    let snippets: Vec<String> = snippet
        .captures_iter(html)
        .map(|c| strip_tags(&c[1]))
        .collect();

    let mut out = Vec::new();
    for (i, caps) in anchor.captures_iter(html).take(count).enumerate() {
        let url = decode_ddg_redirect(&caps[1]);
        let title = strip_tags(&caps[2]);
        let snip = snippets.get(i).cloned().unwrap_or_default();
        out.push(format!("{}. **{}**\n   {}\n   {}", i + 1, title, url, snip));
    }
    out.join("\n\n")
}

/// Result links are wrapped in a `/l/?uddg=<urlencoded>` redirect.
fn decode_ddg_redirect(href: &str) -> String {
    if let Some(pos) = href.find("uddg=") {
        let encoded = &href[pos + 5..];
        let encoded = encoded.split('&').next().unwrap_or(encoded);
        return percent_decode(encoded);
    }
    href.to_string()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn strip_tags(html: &str) -> String {
    let re = regex::Regex::new(r"<[^>]+>").expect("static regex");
    re.replace_all(html, "")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
        <a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpizza&amp;rut=abc">Best <b>Pizza</b> Places</a>
        <a class="result__snippet" href="#">Top rated <b>pizza</b> in town.</a>
        <a rel="nofollow" class="result__a" href="https://plain.example.org/page">Plain Link</a>
        <a class="result__snippet" href="#">Another snippet.</a>
    "##;

    #[test]
    fn parses_titles_urls_and_snippets() {
        let out = parse_results(SAMPLE, 5);
        assert!(out.contains("Best Pizza Places"));
        assert!(out.contains("https://example.com/pizza"));
        assert!(out.contains("Top rated pizza in town."));
        assert!(out.contains("Plain Link"));
    }

    #[test]
    fn count_limits_results() {
        let out = parse_results(SAMPLE, 1);
        assert!(out.contains("Best Pizza Places"));
        assert!(!out.contains("Plain Link"));
    }

    #[test]
    fn redirect_urls_are_decoded() {
        assert_eq!(
            decode_ddg_redirect("//duckduckgo.com/l/?uddg=https%3A%2F%2Fa.io%2Fx&rut=1"),
            "https://a.io/x"
        );
        assert_eq!(
            decode_ddg_redirect("https://direct.example.com"),
            "https://direct.example.com"
        );
    }

    #[test]
    fn tags_and_entities_are_stripped() {
        assert_eq!(strip_tags("a <b>b</b> &amp; c"), "a b & c");
    }

    #[test]
    fn empty_page_yields_empty_string() {
        assert!(parse_results("<html></html>", 5).is_empty());
    }
}
