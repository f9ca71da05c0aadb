// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Crash logging.
//!
//! The runtime never unwinds for recoverable errors — every fallible path
//! returns a typed result.  The panic hook exists for what remains: genuine
//! bugs and integrity failures.  It writes a crash log and re-raises.

use std::path::PathBuf;

use tracing::error;

fn crash_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("runa")
        .join("crash-logs")
}

/// Install a panic hook that writes `<data_dir>/runa/crash-logs/<ts>.txt`
/// before delegating to the previous hook.
pub fn install_crash_hook() {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let dir = crash_log_dir();
        let _ = std::fs::create_dir_all(&dir);
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{stamp}.txt"));
        let backtrace = std::backtrace::Backtrace::force_capture();
        let body = format!("panic: {info}\n\nbacktrace:\n{backtrace}\n");
        if std::fs::write(&path, &body).is_err() {
            error!("failed to write crash log to {}", path.display());
        }
        previous(info);
    }));
}
