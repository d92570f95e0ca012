//! Broadcast queue: an ordered playlist the controller autoplays when no
//! manual broadcast is active.
//!
//! Any direct `start`/`stop`/`live` sets the manual-pause flag; the queue
//! resumes only on an explicit `queue !`.  END events from agents funnel
//! through one queue task, so the END → next transition is serialized.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broadcast;
use crate::state::AppState;

/// One parameterized playback request.  Targets stay an expression and are
/// resolved at fan-out time.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastIntent {
    pub targets: String,
    pub filename: String,
    pub frequency: f64,
    pub ps: String,
    pub rt: String,
    pub pi: String,
    pub loop_flag: bool,
}

/// The intent the queue launched and is waiting on.
#[derive(Debug, Clone)]
pub struct QueueCurrent {
    pub filename: String,
    pub agents: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Queue {
    items: VecDeque<BroadcastIntent>,
    paused: bool,
    current: Option<QueueCurrent>,
}

#[derive(Debug)]
pub enum QueueEvent {
    /// An agent reported END for `filename`.
    Ended { agent_id: String, filename: String },
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, intent: BroadcastIntent) {
        self.items.push_back(intent);
    }

    pub fn pop_last(&mut self) -> Option<BroadcastIntent> {
        self.items.pop_back()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn items(&self) -> &VecDeque<BroadcastIntent> {
        &self.items
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Called by every direct start/stop/live so the queue stops advancing
    /// until the operator resumes it.
    pub fn manual_pause(&mut self) {
        if !self.paused {
            info!("queue paused by manual broadcast command");
        }
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn set_current(&mut self, current: QueueCurrent) {
        self.current = Some(current);
    }

    pub fn current(&self) -> Option<&QueueCurrent> {
        self.current.as_ref()
    }

    /// Decide whether an END event advances the queue.  Pops the next
    /// intent only when not paused and the ended broadcast is the one this
    /// queue launched.
    fn advance_on_end(&mut self, agent_id: &str, filename: &str) -> Option<BroadcastIntent> {
        if self.paused {
            return None;
        }
        let matches = self
            .current
            .as_ref()
            .is_some_and(|c| c.filename == filename && c.agents.iter().any(|a| a == agent_id));
        if !matches {
            return None;
        }
        self.current = None;
        self.items.pop_front()
    }
}

/// The single task serializing END → next transitions.
pub async fn run_queue_task(state: AppState, mut rx: mpsc::Receiver<QueueEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            QueueEvent::Ended { agent_id, filename } => {
                let next = {
                    let mut queue = state.queue.lock().await;
                    queue.advance_on_end(&agent_id, &filename)
                };
                if let Some(intent) = next {
                    info!(filename = %intent.filename, "queue advancing to next item");
                    launch(&state, intent).await;
                }
            }
        }
    }
}

/// Launch one intent through the coordinator and remember it as current.
pub async fn launch(state: &AppState, intent: BroadcastIntent) {
    let agents = broadcast::start_broadcast(
        state,
        &intent.targets,
        &intent.filename,
        intent.frequency,
        &intent.ps,
        &intent.rt,
        &intent.pi,
        intent.loop_flag,
        false,
    )
    .await;
    if agents.is_empty() {
        warn!(filename = %intent.filename, "queue item had no reachable targets");
        return;
    }
    let mut queue = state.queue.lock().await;
    queue.set_current(QueueCurrent {
        filename: intent.filename,
        agents,
    });
}

/// `queue …` console subcommands: `+` push, `-` pop, `*` clear, `!`
/// resume/step, `?` or nothing lists.
pub async fn handle_command(state: &AppState, rest: &[String]) {
    match rest.first().map(String::as_str) {
        Some("+") => {
            if rest.len() < 3 {
                eprintln!("Usage: queue + <targets> <file> [freq] [loop] [ps] [rt] [pi]");
                return;
            }
            let filename = rest[2].clone();
            let intent = BroadcastIntent {
                targets: rest[1].clone(),
                frequency: rest.get(3).and_then(|v| v.parse().ok()).unwrap_or(90.0),
                loop_flag: rest.get(4).is_some_and(|v| v.eq_ignore_ascii_case("true")),
                ps: rest.get(5).cloned().unwrap_or_else(|| "BotWave".to_owned()),
                rt: rest.get(6).cloned().unwrap_or_else(|| filename.clone()),
                pi: rest.get(7).cloned().unwrap_or_else(|| "FFFF".to_owned()),
                filename,
            };
            let mut queue = state.queue.lock().await;
            queue.push(intent);
            println!("Queued ({} item(s))", queue.items().len());
        }
        Some("-") => {
            let mut queue = state.queue.lock().await;
            match queue.pop_last() {
                Some(intent) => println!("Removed {}", intent.filename),
                None => println!("Queue is empty"),
            }
        }
        Some("*") => {
            let mut queue = state.queue.lock().await;
            queue.clear();
            println!("Queue cleared");
        }
        Some("!") => {
            let next = {
                let mut queue = state.queue.lock().await;
                queue.resume();
                if queue.current().is_none() {
                    queue.items.pop_front()
                } else {
                    None
                }
            };
            match next {
                Some(intent) => launch(state, intent).await,
                None => println!("Queue resumed"),
            }
        }
        Some("?") | None => {
            let queue = state.queue.lock().await;
            println!(
                "Queue: {} item(s){}",
                queue.items().len(),
                if queue.is_paused() { " [paused]" } else { "" }
            );
            for (i, intent) in queue.items().iter().enumerate() {
                println!(
                    "  {}. {} -> {} ({} MHz{})",
                    i + 1,
                    intent.filename,
                    intent.targets,
                    intent.frequency,
                    if intent.loop_flag { ", loop" } else { "" }
                );
            }
            println!("Subcommands: + push, - pop, * clear, ! resume, ? list");
        }
        Some(other) => eprintln!("Unknown queue subcommand: {other}"),
    }
}
