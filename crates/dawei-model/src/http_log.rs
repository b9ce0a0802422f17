// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Raw HTTP traffic logging under `{workspace}/.dawei/http/`.
//!
//! One `{timestamp}_request.json` / `{timestamp}_response.json` pair per
//! outbound request.  The response file is written from a [`Drop`] guard so
//! it lands on disk even when the consumer abandons the stream mid-flight.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Clone)]
pub struct HttpLogger {
    dir: PathBuf,
}

impl HttpLogger {
    /// Logger rooted at `{workspace}/.dawei/http`.
    pub fn for_workspace(workspace: impl Into<PathBuf>) -> Self {
        Self { dir: workspace.into().join(".dawei").join("http") }
    }

    /// Write the request log and return the guard that will write the paired
    /// response log when dropped.
    pub fn log_request(&self, url: &str, provider: &str, model: &str, body: &Value) -> ResponseLog {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
        let request_path = self.dir.join(format!("{stamp}_request.json"));
        let response_path = self.dir.join(format!("{stamp}_response.json"));

        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "cannot create http log dir");
            return ResponseLog::disabled();
        }

        let request_data = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "url": url,
            "provider": provider,
            "model": model,
            "params": body,
        });
        match serde_json::to_string_pretty(&request_data) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&request_path, text) {
                    warn!(path = %request_path.display(), error = %e, "request log write failed");
                } else {
                    info!(path = %request_path.display(), "request logged");
                }
            }
            Err(e) => warn!(error = %e, "request log serialization failed"),
        }

        ResponseLog {
            inner: Some(Arc::new(ResponseLogInner {
                path: response_path,
                url: url.to_string(),
                state: Mutex::new(ResponseState::default()),
            })),
        }
    }
}

#[derive(Default)]
struct ResponseState {
    status: Option<u16>,
    chunks: Vec<String>,
    error: Option<String>,
}

struct ResponseLogInner {
    path: PathBuf,
    url: String,
    state: Mutex<ResponseState>,
}

/// Accumulates response bytes and writes the log file exactly once, when the
/// last clone is dropped — whether or not the stream was fully consumed.
#[derive(Clone)]
pub struct ResponseLog {
    inner: Option<Arc<ResponseLogInner>>,
}

impl ResponseLog {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn set_status(&self, status: u16) {
        if let Some(inner) = &self.inner {
            inner.state.lock().unwrap_or_else(|e| e.into_inner()).status = Some(status);
        }
    }

    pub fn push_chunk(&self, chunk: &str) {
        if let Some(inner) = &self.inner {
            inner.state.lock().unwrap_or_else(|e| e.into_inner()).chunks.push(chunk.to_string());
        }
    }

    pub fn set_error(&self, error: impl Into<String>) {
        if let Some(inner) = &self.inner {
            inner.state.lock().unwrap_or_else(|e| e.into_inner()).error = Some(error.into());
        }
    }
}

impl Drop for ResponseLogInner {
    fn drop(&mut self) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let raw: String = state.chunks.concat();
        let data = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "status": state.status,
            "url": self.url,
            "raw_response": raw,
            "chunks_count": state.chunks.len(),
            "total_bytes": raw.len(),
            "error": state.error,
        });
        match serde_json::to_string_pretty(&data) {
            Ok(text) => {
                if let Err(e) = std::fs::write(&self.path, text) {
                    warn!(path = %self.path.display(), error = %e, "response log write failed");
                } else {
                    info!(path = %self.path.display(), "response logged");
                }
            }
            Err(e) => warn!(error = %e, "response log serialization failed"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
