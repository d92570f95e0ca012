//! Operator console.
//!
//! Reads command lines from stdin and executes them against the fleet.
//! Handler scripts replay through [`execute_line`] too, so the prompt and
//! the scripts share one grammar.  Operator mistakes (unknown targets,
//! missing arguments) are reported locally and never sent on the wire.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::io::AsyncBufReadExt;
use tracing::error;

use crate::state::AppState;
use crate::{broadcast, fileops, queue, registry, sync};

const SHELL_TIMEOUT: Duration = Duration::from_secs(30);

/// Read stdin until EOF or `exit`.
pub async fn run_console(state: AppState) {
    println!("Type 'help' for commands");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if !execute_line(&state, &line).await {
            return;
        }
    }
    // stdin closed
    state.shutdown().await;
}

/// Execute one console line.  Returns false when the operator asked to
/// exit.  Boxed so handler scripts can replay lines that themselves fire
/// handlers.
pub fn execute_line<'a>(state: &'a AppState, line: &'a str) -> BoxFuture<'a, bool> {
    async move {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return true;
        }
        let tokens = match bw_protocol::split_line(line) {
            Ok(tokens) => tokens,
            Err(e) => {
                eprintln!("Invalid command syntax: {e}");
                return true;
            }
        };
        let Some(first) = tokens.first() else {
            return true;
        };

        match first.to_lowercase().as_str() {
            "exit" => {
                state.shutdown().await;
                return false;
            }
            "list" => list_clients(state).await,
            "kick" => {
                if tokens.len() < 2 {
                    eprintln!("Usage: kick <targets> [reason]");
                } else {
                    let reason = if tokens.len() > 2 {
                        tokens[2..].join(" ")
                    } else {
                        "Kicked by administrator".to_owned()
                    };
                    broadcast::kick(state, &tokens[1], &reason).await;
                }
            }
            "upload" => {
                if tokens.len() < 3 {
                    eprintln!("Usage: upload <targets> <file|folder>");
                } else {
                    let targets = registry::resolve_targets(state, &tokens[1]).await;
                    fileops::upload_file(state, &targets, Path::new(&tokens[2])).await;
                }
            }
            "dl" => {
                if tokens.len() < 3 {
                    eprintln!("Usage: dl <targets> <url>");
                } else {
                    let targets = registry::resolve_targets(state, &tokens[1]).await;
                    fileops::download_url(state, &targets, &tokens[2]).await;
                }
            }
            "lf" => {
                if tokens.len() < 2 {
                    eprintln!("Usage: lf <targets>");
                } else {
                    let targets = registry::resolve_targets(state, &tokens[1]).await;
                    fileops::list_files(state, &targets).await;
                }
            }
            "rm" => {
                if tokens.len() < 3 {
                    eprintln!("Usage: rm <targets> <filename|all>");
                } else {
                    let targets = registry::resolve_targets(state, &tokens[1]).await;
                    fileops::remove_file(state, &targets, &tokens[2]).await;
                }
            }
            "sync" => {
                if tokens.len() < 3 {
                    eprintln!("Usage: sync <targets|folder/> <source_target|folder/>");
                } else {
                    sync::sync_files(state, &tokens[1], &tokens[2]).await;
                }
            }
            "start" => {
                if tokens.len() < 3 {
                    eprintln!("Usage: start <targets> <file> [freq] [loop] [ps] [rt] [pi]");
                } else {
                    let filename = tokens[2].clone();
                    let frequency = tokens.get(3).and_then(|v| v.parse().ok()).unwrap_or(90.0);
                    let loop_flag = tokens.get(4).is_some_and(|v| v.eq_ignore_ascii_case("true"));
                    let ps = tokens.get(5).cloned().unwrap_or_else(|| "BotWave".to_owned());
                    let rt = tokens.get(6).cloned().unwrap_or_else(|| filename.clone());
                    let pi = tokens.get(7).cloned().unwrap_or_else(|| "FFFF".to_owned());
                    broadcast::start_broadcast(
                        state, &tokens[1], &filename, frequency, &ps, &rt, &pi, loop_flag, true,
                    )
                    .await;
                }
            }
            "live" => {
                if tokens.len() < 2 {
                    eprintln!("Usage: live <targets> [freq] [ps] [rt] [pi]");
                } else {
                    let frequency = tokens.get(2).and_then(|v| v.parse().ok()).unwrap_or(90.0);
                    let ps = tokens.get(3).cloned().unwrap_or_else(|| "BotWave".to_owned());
                    let rt = tokens
                        .get(4)
                        .cloned()
                        .unwrap_or_else(|| "Broadcasting".to_owned());
                    let pi = tokens.get(5).cloned().unwrap_or_else(|| "FFFF".to_owned());
                    broadcast::start_live(state, &tokens[1], frequency, &ps, &rt, &pi).await;
                }
            }
            "stop" => {
                if tokens.len() < 2 {
                    eprintln!("Usage: stop <targets>");
                } else {
                    broadcast::stop_broadcast(state, &tokens[1]).await;
                }
            }
            "queue" => queue::handle_command(state, &tokens[1..]).await,
            "handlers" => match tokens.get(1) {
                Some(name) => state.handlers.list_commands(name).await,
                None => state.handlers.list().await,
            },
            "<" => {
                if tokens.len() < 2 {
                    eprintln!("Usage: < <shell command>");
                } else {
                    run_shell_command(&tokens[1..].join(" ")).await;
                }
            }
            "help" => display_help(),
            other => eprintln!("Unknown command: {other}"),
        }
        true
    }
    .boxed()
}

async fn list_clients(state: &AppState) {
    let registry = state.registry.read().await;
    if registry.is_empty() {
        println!("No clients connected");
        return;
    }
    println!("Connected Clients");
    for (agent_id, record) in registry.iter() {
        println!("ID: {agent_id}");
        println!("  Hostname: {}", record.machine.hostname);
        println!("  Machine: {}", record.machine.machine);
        println!("  System: {}", record.machine.system);
        println!("  Protocol Version: {}", record.protocol_version);
        println!("  Connected: {}", record.connected_at.format("%Y-%m-%d %H:%M:%S"));
        println!("  Last seen: {}", record.last_seen.format("%Y-%m-%d %H:%M:%S"));
        println!();
    }
}

async fn run_shell_command(command: &str) {
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "error executing shell command");
            return;
        }
    };

    match tokio::time::timeout(SHELL_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if !output.stdout.is_empty() {
                print!("{}", String::from_utf8_lossy(&output.stdout));
            }
            if !output.status.success() && !output.stderr.is_empty() {
                println!("STDERR ({}):", output.status.code().unwrap_or(-1));
                print!("{}", String::from_utf8_lossy(&output.stderr));
            }
        }
        Ok(Err(e)) => error!(error = %e, "error executing shell command"),
        Err(_) => error!("command execution timeout"),
    }
}

fn display_help() {
    println!("BotWave Server - Help");
    println!();
    println!("list                                     List all connected clients");
    println!("start <targets> <file> [freq] [loop] [ps] [rt] [pi]");
    println!("                                         Start broadcasting on client(s)");
    println!("stop <targets>                           Stop broadcasting on client(s)");
    println!("live <targets> [freq] [ps] [rt] [pi]     Start a live audio broadcast");
    println!("queue [+|-|*|!|?]                        Manage the broadcast queue");
    println!("upload <targets> <file|folder>           Push a file or folder to client(s)");
    println!("dl <targets> <url>                       Ask client(s) to fetch a URL");
    println!("lf <targets>                             List broadcastable files on client(s)");
    println!("rm <targets> <filename|all>              Remove a file from client(s)");
    println!("sync <targets|folder/> <source|folder/>  Synchronize files");
    println!("kick <targets> [reason]                  Kick client(s)");
    println!("handlers [filename]                      List handler scripts or their commands");
    println!("< <command>                              Run a shell command on this host");
    println!("exit                                     Shut down the server");
    println!();
    println!("Targets: 'all', a client id, a hostname, or a comma-separated list");
}
