// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! llama.cpp server backend.
//!
//! Owns a `llama-server` child process serving the loaded GGUF file and
//! drives it over the local HTTP API:
//!
//! - `GET  /health` — readiness poll during load
//! - `GET  /props`  — the *actual* `n_ctx`, slot count and chat template
//! - `POST /completion` — SSE token streaming with `cache_prompt` so the
//!   server reuses the evaluated KV prefix across iterations
//! - `POST /slots/{id}?action=erase` — sequence disposal
//!
//! The child is spawned with `kill_on_drop`; swapping models disposes the
//! previous process synchronously before the next one starts.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::backend::{
    BackendInfo, EvalOutcome, GenRequest, InferEvent, InferenceBackend, TokenStream,
};
use crate::error::EngineError;

/// Stderr markers that identify a device allocation failure.
const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "failed to allocate",
    "CUDA error",
    "ggml_backend_alloc",
    "OOM",
];

pub struct LlamaServerBackend {
    binary: String,
    port: u16,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
    /// Captured child stderr, used to classify early exits.
    stderr_tail: Arc<StdMutex<String>>,
    info: RwLock<Option<BackendInfo>>,
}

impl LlamaServerBackend {
    pub fn new(binary: impl Into<String>, port: u16) -> Self {
        Self {
            binary: binary.into(),
            port,
            client: reqwest::Client::new(),
            child: Mutex::new(None),
            stderr_tail: Arc::new(StdMutex::new(String::new())),
            info: RwLock::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    fn slots(&self) -> u32 {
        self.info
            .read()
            .ok()
            .and_then(|i| i.as_ref().map(|i| i.slots))
            .unwrap_or(1)
    }

    /// Whether the captured stderr tail looks like a device OOM.
    fn stderr_indicates_oom(&self) -> bool {
        let tail = self.stderr_tail.lock().map(|t| t.clone()).unwrap_or_default();
        OOM_MARKERS.iter().any(|m| tail.contains(m))
    }

    async fn kill_child(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Poll `/health` until the server answers or the child dies.
    async fn wait_ready(&self) -> Result<(), EngineError> {
        loop {
            {
                let mut guard = self.child.lock().await;
                if let Some(child) = guard.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        guard.take();
                        return if self.stderr_indicates_oom() {
                            Err(EngineError::OutOfMemory)
                        } else {
                            Err(EngineError::Load(format!(
                                "llama-server exited during startup ({status})"
                            )))
                        };
                    }
                }
            }
            if let Ok(resp) = self.client.get(self.url("/health")).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn fetch_props(&self, gpu_layers: u32) -> Result<BackendInfo, EngineError> {
        let props: Value = self
            .client
            .get(self.url("/props"))
            .send()
            .await
            .map_err(|e| EngineError::Backend(format!("props request failed: {e}")))?
            .json()
            .await
            .map_err(|e| EngineError::Backend(format!("props parse failed: {e}")))?;

        let n_ctx = props["default_generation_settings"]["n_ctx"]
            .as_u64()
            .unwrap_or(0) as u32;
        let slots = props["total_slots"].as_u64().unwrap_or(1) as u32;
        // Thinking support is a property of the *loaded* template, never the
        // filename.  Applying a think budget to a non-thinking model corrupts
        // its output, so this is the only place that decides.
        let template = props["chat_template"].as_str().unwrap_or("");
        let supports_thinking = template.contains("<think>") || template.contains("reasoning");

        Ok(BackendInfo {
            n_ctx,
            supports_thinking,
            slots,
            gpu_layers,
        })
    }

    fn completion_body(req: &GenRequest, slot: u32, stream: bool) -> Value {
        let mut body = json!({
            "prompt": req.prompt,
            "stream": stream,
            "n_predict": req.n_predict,
            "temperature": req.sampling.temperature,
            "top_p": req.sampling.top_p,
            "top_k": req.sampling.top_k,
            "repeat_penalty": req.sampling.repeat_penalty,
            "frequency_penalty": req.sampling.frequency_penalty,
            "presence_penalty": req.sampling.presence_penalty,
            "cache_prompt": req.cache_prompt,
            "id_slot": slot,
        });
        if !req.stop.is_empty() {
            body["stop"] = json!(req.stop);
        }
        if let Some(grammar) = &req.grammar {
            body["grammar"] = json!(grammar);
        }
        body
    }

    /// Release a slot's evaluated tokens.  Used for sequence resets and for
    /// secondary-slot cleanup after `evaluate`.
    async fn erase_slot(&self, slot: u32) {
        let url = self.url(&format!("/slots/{slot}?action=erase"));
        if let Err(e) = self.client.post(&url).send().await {
            warn!(slot, "slot erase failed: {e}");
        }
    }
}

#[async_trait]
impl InferenceBackend for LlamaServerBackend {
    fn name(&self) -> &str {
        "llama-server"
    }

    async fn load(
        &self,
        model_path: &Path,
        gpu_layers: u32,
        ctx_size: u32,
    ) -> Result<BackendInfo, EngineError> {
        // Dispose the previous model/context/process before loading the next.
        self.kill_child().await;
        if let Ok(mut info) = self.info.write() {
            *info = None;
        }
        if let Ok(mut tail) = self.stderr_tail.lock() {
            tail.clear();
        }

        debug!(
            model = %model_path.display(),
            gpu_layers,
            ctx_size,
            "spawning llama-server"
        );

        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(model_path)
            .arg("--port")
            .arg(self.port.to_string())
            .arg("--n-gpu-layers")
            .arg(gpu_layers.to_string())
            .arg("--ctx-size")
            .arg(ctx_size.to_string())
            .arg("--parallel")
            .arg("2")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Load(format!("spawn {}: {e}", self.binary)))?;

        // Capture stderr so early exits can be classified (OOM vs other).
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&self.stderr_tail);
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut t) = tail.lock() {
                        t.push_str(&line);
                        t.push('\n');
                        // Keep the tail bounded.
                        if t.len() > 16 * 1024 {
                            let cut = t.len() - 8 * 1024;
                            t.drain(..cut);
                        }
                    }
                }
            });
        }

        *self.child.lock().await = Some(child);

        self.wait_ready().await?;
        let info = self.fetch_props(gpu_layers).await?;
        if let Ok(mut slot) = self.info.write() {
            *slot = Some(info.clone());
        }
        Ok(info)
    }

    async fn unload(&self) {
        self.kill_child().await;
        if let Ok(mut info) = self.info.write() {
            *info = None;
        }
    }

    async fn generate(&self, req: GenRequest) -> Result<TokenStream, EngineError> {
        let body = Self::completion_body(&req, 0, true);
        let resp = self
            .client
            .post(self.url("/completion"))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::Backend(format!("completion request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if let Some(n_ctx) = extract_n_ctx_from_overflow(&text) {
                return Err(EngineError::ContextOverflow { n_ctx });
            }
            return Err(EngineError::Backend(format!(
                "completion returned {status}: {text}"
            )));
        }

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<InferEvent, EngineError>>(64);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::Backend(format!("stream error: {e}"))))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                // SSE events are separated by a blank line.
                while let Some(pos) = buf.find("\n\n") {
                    let event: String = buf.drain(..pos + 2).collect();
                    for line in event.lines() {
                        let Some(payload) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let Ok(v) = serde_json::from_str::<Value>(payload) else {
                            continue;
                        };
                        if v["stop"].as_bool() == Some(true) {
                            let done = InferEvent::Done {
                                prefix_tokens: v["tokens_evaluated"].as_u64().unwrap_or(0)
                                    as u32,
                                hit_token_cap: v["stopped_limit"].as_bool().unwrap_or(false),
                            };
                            let _ = tx.send(Ok(done)).await;
                            return;
                        }
                        if let Some(content) = v["content"].as_str() {
                            if !content.is_empty()
                                && tx
                                    .send(Ok(InferEvent::Token(content.to_string())))
                                    .await
                                    .is_err()
                            {
                                // Receiver dropped — generation was cancelled.
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)) as TokenStream)
    }

    async fn evaluate(&self, req: GenRequest) -> Result<EvalOutcome, EngineError> {
        // Utility calls run on a temporary secondary slot so the main
        // sequence's KV prefix survives.  Single-slot servers fall back to
        // the main sequence; the caller must invalidate its marker then.
        let (slot, used_main_slot) = if self.slots() >= 2 { (1, false) } else { (0, true) };

        let mut body = Self::completion_body(&req, slot, false);
        body["cache_prompt"] = json!(false);

        let result = async {
            let resp = self
                .client
                .post(self.url("/completion"))
                .json(&body)
                .send()
                .await
                .map_err(|e| EngineError::Backend(format!("evaluate request failed: {e}")))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                if let Some(n_ctx) = extract_n_ctx_from_overflow(&text) {
                    return Err(EngineError::ContextOverflow { n_ctx });
                }
                return Err(EngineError::Backend(format!(
                    "evaluate returned {status}: {text}"
                )));
            }
            let v: Value = resp
                .json()
                .await
                .map_err(|e| EngineError::Backend(format!("evaluate parse failed: {e}")))?;
            Ok(v["content"].as_str().unwrap_or("").to_string())
        }
        .await;

        // Guarded cleanup: the temporary slot and its tokens are released on
        // every exit path, success or error.
        if !used_main_slot {
            self.erase_slot(slot).await;
        }

        result.map(|text| EvalOutcome {
            text,
            used_main_slot,
        })
    }

    async fn reset_sequence(&self) -> Result<(), EngineError> {
        if self.info.read().map(|i| i.is_none()).unwrap_or(true) {
            return Err(EngineError::NoModel);
        }
        self.erase_slot(0).await;
        Ok(())
    }
}

/// Extract `n_ctx` from a llama.cpp context-overflow error body.
///
/// llama.cpp-compatible servers return a structured error when the request
/// exceeds the loaded context window:
///
/// ```json
/// {"error":{"type":"exceed_context_size_error","n_ctx":54272,"n_prompt_tokens":54298}}
/// ```
fn extract_n_ctx_from_overflow(body: &str) -> Option<u32> {
    if !body.contains("exceed_context_size_error") {
        return None;
    }
    let json_start = body.find('{')?;
    let v: Value = serde_json::from_str(&body[json_start..]).ok()?;
    if let Some(n) = v["error"]["n_ctx"].as_u64() {
        return Some(n as u32);
    }
    v["n_ctx"].as_u64().map(|n| n as u32)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use runa_model::SamplingParams;

    #[test]
    fn overflow_error_body_parses() {
        let body = r#"{"error":{"type":"exceed_context_size_error","n_ctx":54272,"n_prompt_tokens":54298}}"#;
        assert_eq!(extract_n_ctx_from_overflow(body), Some(54272));
    }

    #[test]
    fn overflow_with_driver_prefix_parses() {
        let body = r#"llama error 400: {"error":{"type":"exceed_context_size_error","n_ctx":8192}}"#;
        assert_eq!(extract_n_ctx_from_overflow(body), Some(8192));
    }

    #[test]
    fn flat_overflow_format_parses() {
        let body = r#"{"n_ctx":4096,"type":"exceed_context_size_error"}"#;
        assert_eq!(extract_n_ctx_from_overflow(body), Some(4096));
    }

    #[test]
    fn unrelated_error_is_none() {
        assert_eq!(extract_n_ctx_from_overflow("500 internal error"), None);
    }

    #[test]
    fn completion_body_includes_sampling() {
        let req = GenRequest::text("hello", SamplingParams::default());
        let body = LlamaServerBackend::completion_body(&req, 0, true);
        assert_eq!(body["prompt"], "hello");
        assert_eq!(body["cache_prompt"], true);
        assert!(body["temperature"].as_f64().is_some());
        assert!(body.get("grammar").is_none());
    }

    #[test]
    fn completion_body_carries_grammar_when_set() {
        let mut req = GenRequest::text("x", SamplingParams::default());
        req.grammar = Some("root ::= \"a\"".to_string());
        let body = LlamaServerBackend::completion_body(&req, 0, true);
        assert!(body["grammar"].as_str().unwrap().starts_with("root"));
    }
}
