mod auth;
mod backup;
mod calc;
mod config;
mod db;
mod error;
mod ipc;
mod model;
mod notify;

use std::io::{self, BufRead, Write};

fn main() {
    let config = match config::DaemonConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("schoold: {e:#}; using defaults");
            config::DaemonConfig::default()
        }
    };
    if let Err(e) = config::init_logging(&config) {
        eprintln!("schoold: {e:#}");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "schoold starting");

    let mut state = ipc::AppState::new(config);
    if let Some(path) = state.config.workspace.clone() {
        if let Err(e) = ipc::open_workspace(&mut state, &path) {
            tracing::error!(workspace = %path.display(), error = %e, "failed to open workspace from SCHOOLD_WORKSPACE");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed; exiting");
}
