//! Handler-script replay.
//!
//! A handler is a plain text file in the handlers directory named
//! `s_on<event>`, holding one console command per line (`#` starts a
//! comment).  Lines replay through the same parser as the interactive
//! prompt; handlers are not a separate language.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::console;
use crate::state::AppState;

/// Events a handler file can exist for.  `onwsjoin`/`onwsleave` belong to
/// the remote command shell and are listed but never fired here.
pub const HANDLER_EVENTS: &[&str] = &[
    "onready",
    "onstart",
    "onstop",
    "onconnect",
    "ondisconnect",
    "onwsjoin",
    "onwsleave",
];

pub struct HandlerExecutor {
    dir: PathBuf,
}

impl HandlerExecutor {
    pub fn new(dir: PathBuf) -> Self {
        HandlerExecutor { dir }
    }

    /// Replay the handler file `name` (e.g. `s_onstart`), if present.
    pub async fn run(&self, state: &AppState, name: &str) {
        let path = self.dir.join(name);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => return,
        };

        info!(handler = %name, "running handler script");
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            console::execute_line(state, line).await;
        }
    }

    /// Print the handler files present in the handlers directory.
    pub async fn list(&self) {
        let mut found = false;
        for event in HANDLER_EVENTS {
            let name = format!("s_{event}");
            if tokio::fs::metadata(self.dir.join(&name)).await.is_ok() {
                println!("  {name}");
                found = true;
            }
        }
        if !found {
            println!("  No handler scripts in {}", self.dir.display());
        }
    }

    /// Print the commands a specific handler file would replay.
    pub async fn list_commands(&self, name: &str) {
        let path = self.dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                println!("{name}:");
                for line in content.lines() {
                    let line = line.split('#').next().unwrap_or("").trim();
                    if !line.is_empty() {
                        println!("  {line}");
                    }
                }
            }
            Err(e) => warn!(handler = %name, error = %e, "handler file unreadable"),
        }
    }
}
