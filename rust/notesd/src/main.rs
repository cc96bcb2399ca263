mod backup;
mod config;
mod db;
mod error;
mod ipc;
mod services;
mod store;

use anyhow::Context;
use std::io::{self, BufRead, Write};

fn main() -> anyhow::Result<()> {
    // stdout carries the protocol; logs go to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("notesd=info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = config::Config::from_env().context("invalid configuration")?;
    let mailer = services::mail::from_config(config.smtp.as_ref());
    let startup_workspace = config.workspace.clone();
    let mut state = ipc::AppState::new(config, mailer);

    if let Some(path) = startup_workspace {
        state
            .open_workspace(path)
            .context("failed to open NOTESD_WORKSPACE")?;
    }
    log::info!("notesd {} ready", env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                log::error!("stdin closed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer to.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() },
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        log::debug!("-> {} {}", req.id, req.method);
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }

    state.close_workspace();
    Ok(())
}
