mod auth;
mod calc;
mod config;
mod db;
mod ipc;
mod logging;
mod sources;
mod store;

use serde_json::json;
use std::io::{self, BufRead, Write};

fn main() {
    let config = config::Config::from_env();
    logging::init_logging(config.log_level);
    for warning in &config.warnings {
        log::warn!("event=config module=main status=fallback detail={}", warning);
    }
    log::info!(
        "event=startup module=main status=ok version={}",
        env!("CARGO_PKG_VERSION")
    );

    let mut state = ipc::AppState::new(config.clone());
    if let Some(path) = config.workspace.as_deref() {
        // A broken startup workspace leaves the process usable; the client
        // can still call workspace.select.
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            log::error!(
                "event=workspace_open module=main status=error path={} error={:#}",
                path.to_string_lossy(),
                e
            );
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
                log::warn!("event=request module=main status=bad_json error={}", e);
                let _ = writeln!(
                    stdout,
                    "{}",
                    json!({ "ok": false, "error": { "code": "bad_json", "message": e.to_string() } })
                );
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
    log::info!("event=shutdown module=main status=ok");
}
