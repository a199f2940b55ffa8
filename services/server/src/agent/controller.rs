//! The agent run controller.
//!
//! Serialises message routing per session, maps the agent's event stream to
//! event-store rows (stamped with the current run id), closes runs, and
//! continues orphaned follow-ups. Persistence failures never propagate out
//! of the event pipeline; they are logged and the stream continues.

use crate::agent::{Agent, AgentEvent};
use crate::error::StoreResult;
use crate::events::realtime::{RealtimeStore, SubscriberId};
use crate::events::NewEvent;
use rill_protocol::EventType;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Dedupe keys for the one-time bootstrap injection.
const BOOTSTRAP_TOOL_CALL_KEY: &str = "bootstrap:v1:tool_call";
const BOOTSTRAP_TOOL_RESULT_KEY: &str = "bootstrap:v1:tool_result";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identity used for the process-wide bootstrap marker.
    pub agent_id: String,
    /// Workspace file injected as a synthetic tool round on the first user
    /// message. No injection when absent.
    pub bootstrap_file: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            agent_id: "rill-agent".to_owned(),
            bootstrap_file: None,
        }
    }
}

/// How a user message was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// A fresh run was started for it.
    Prompt,
    /// The agent was streaming; it was enqueued as a follow-up.
    FollowUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReceipt {
    pub run_id: String,
    pub routed: Routed,
}

#[derive(Debug, Clone)]
struct RunBinding {
    session_id: String,
    run_id: String,
}

struct Watcher {
    subscriber: SubscriberId,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// RunController
// ---------------------------------------------------------------------------

pub struct RunController {
    events: Arc<RealtimeStore>,
    agent: Arc<dyn Agent>,
    config: ControllerConfig,
    session_locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    binding: StdMutex<Option<RunBinding>>,
    watchers: StdMutex<HashMap<String, Watcher>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl RunController {
    /// Wire a controller to its agent: install the event channel and start
    /// the pump task that maps events to persisted rows.
    pub fn new(
        events: Arc<RealtimeStore>,
        agent: Arc<dyn Agent>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let controller = Arc::new(RunController {
            events,
            agent,
            config,
            session_locks: StdMutex::new(HashMap::new()),
            binding: StdMutex::new(None),
            watchers: StdMutex::new(HashMap::new()),
            pump: StdMutex::new(None),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        controller.agent.subscribe(tx);
        let weak = Arc::downgrade(&controller);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_agent_event(event).await;
            }
        });
        *controller.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(pump);
        controller
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// Route one user message: start a run, or enqueue a follow-up while
    /// the agent is streaming. One routing decision at a time per session.
    pub async fn handle_message(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
    ) -> StoreResult<RouteReceipt> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if self.events.get_session(session_id).await?.is_none() {
            self.events.create_session(Some(session_id)).await?;
        }
        self.maybe_inject_bootstrap(session_id).await;

        let run_id = Uuid::new_v4().to_string();
        if self.agent.is_streaming() {
            if let Err(e) = self.agent.follow_up(text).await {
                warn!(session_id, error = %e, "follow-up enqueue failed");
            }
            info!(session_id, run_id, "message routed as follow-up");
            return Ok(RouteReceipt {
                run_id,
                routed: Routed::FollowUp,
            });
        }

        self.set_binding(session_id, &run_id);
        self.agent.set_run_id(Some(run_id.clone()));

        let weak = Arc::downgrade(self);
        let agent = self.agent.clone();
        let session = session_id.to_owned();
        let run = run_id.clone();
        let prompt_text = text.to_owned();
        // The prompt runs to completion on its own task; the routing
        // decision does not wait for it.
        tokio::spawn(async move {
            if let Err(e) = agent.prompt(&prompt_text).await {
                if let Some(controller) = weak.upgrade() {
                    controller.fail_run(&session, &run, &e.to_string()).await;
                }
            }
        });
        info!(session_id, run_id, "message routed as prompt");
        Ok(RouteReceipt {
            run_id,
            routed: Routed::Prompt,
        })
    }

    pub async fn steer(&self, session_id: &str, text: &str) -> StoreResult<()> {
        if let Err(e) = self.agent.steer(text).await {
            warn!(session_id, error = %e, "steer failed");
        }
        Ok(())
    }

    pub async fn abort(&self, session_id: &str) -> StoreResult<()> {
        info!(session_id, "aborting run");
        self.agent.abort().await;
        Ok(())
    }

    /// Watch a session: externally persisted user messages (empty run id)
    /// are routed through `handle_message`. Idempotent per session.
    pub fn watch(self: &Arc<Self>, session_id: &str) {
        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        if watchers.contains_key(session_id) {
            return;
        }
        let (subscriber, mut rx) = self.events.subscribe(session_id);
        let weak = Arc::downgrade(self);
        let session = session_id.to_owned();
        let task = tokio::spawn(async move {
            while let Some(row) = rx.recv().await {
                if row.event_type != EventType::UserMessage {
                    continue;
                }
                if row.run_id.as_deref().is_some_and(|id| !id.is_empty()) {
                    // Produced by this controller's own run; not a follow-up.
                    continue;
                }
                let Some(text) = row.payload.get("text").and_then(|v| v.as_str()) else {
                    warn!(session = %session, seq = row.seq, "watched user message without text");
                    continue;
                };
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = controller.handle_message(&session, text).await {
                    error!(session = %session, error = %e, "failed to route watched message");
                }
            }
        });
        watchers.insert(
            session_id.to_owned(),
            Watcher { subscriber, task },
        );
    }

    pub fn unwatch(&self, session_id: &str) {
        let removed = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        if let Some(watcher) = removed {
            self.events.unsubscribe(session_id, watcher.subscriber);
            watcher.task.abort();
        }
    }

    /// Tear down watchers and the event pump.
    pub fn dispose(&self) {
        let sessions: Vec<String> = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for session in sessions {
            self.unwatch(&session);
        }
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Event persistence
    // -----------------------------------------------------------------------

    async fn handle_agent_event(self: &Arc<Self>, event: AgentEvent) {
        let Some(binding) = self.current_binding() else {
            warn!("agent event with no bound run; dropping");
            return;
        };
        let session = binding.session_id;
        let run = binding.run_id;

        match event {
            AgentEvent::AgentStart => {
                self.persist(&session, &run, EventType::AgentStart, json!({})).await;
            }
            AgentEvent::TurnStart => {
                self.persist(&session, &run, EventType::TurnStart, json!({})).await;
            }
            AgentEvent::TurnEnd => {
                self.persist(&session, &run, EventType::TurnEnd, json!({})).await;
            }
            AgentEvent::MessageStart { message } => {
                self.persist(
                    &session,
                    &run,
                    EventType::MessageStart,
                    json!({ "message": message }),
                )
                .await;
            }
            AgentEvent::MessageUpdate { delta } => {
                self.persist(
                    &session,
                    &run,
                    EventType::MessageUpdate,
                    json!({ "delta": delta }),
                )
                .await;
            }
            AgentEvent::MessageEnd { message } => {
                let is_assistant = message.get("role").and_then(|r| r.as_str()) == Some("assistant");
                let text = extract_text(&message);
                self.persist(
                    &session,
                    &run,
                    EventType::MessageEnd,
                    json!({ "message": message }),
                )
                .await;
                // Compat projection so conversation history still works.
                if is_assistant {
                    self.persist(
                        &session,
                        &run,
                        EventType::AssistantFinal,
                        json!({ "text": text }),
                    )
                    .await;
                }
            }
            AgentEvent::ToolExecutionStart {
                tool_call_id,
                name,
                arguments,
            } => {
                self.persist(
                    &session,
                    &run,
                    EventType::ToolExecutionStart,
                    json!({ "tool_call_id": tool_call_id, "name": name, "arguments": arguments }),
                )
                .await;
            }
            AgentEvent::ToolExecutionUpdate {
                tool_call_id,
                output,
            } => {
                self.persist(
                    &session,
                    &run,
                    EventType::ToolExecutionUpdate,
                    json!({ "tool_call_id": tool_call_id, "output": output }),
                )
                .await;
            }
            AgentEvent::ToolExecutionEnd {
                tool_call_id,
                name,
                result,
            } => {
                self.persist(
                    &session,
                    &run,
                    EventType::ToolExecutionEnd,
                    json!({ "tool_call_id": tool_call_id.clone(), "result": result.clone() }),
                )
                .await;
                // Compat projection.
                self.persist(
                    &session,
                    &run,
                    EventType::ToolResult,
                    json!({ "tool_call_id": tool_call_id, "name": name, "content": result }),
                )
                .await;
            }
            AgentEvent::Error { message } => {
                self.persist(&session, &run, EventType::Error, json!({ "message": message }))
                    .await;
            }
            AgentEvent::AgentEnd { messages } => {
                self.persist(
                    &session,
                    &run,
                    EventType::AgentEnd,
                    json!({ "messages": messages }),
                )
                .await;
                self.persist(
                    &session,
                    &run,
                    EventType::RunClosed,
                    json!({ "reason": "completed" }),
                )
                .await;
                self.clear_binding(&run);
                self.agent.set_run_id(None);

                if self.agent.has_queued_messages() {
                    // The agent_end event fires inside the agent's own loop
                    // before its finalisation clears state; defer so the
                    // controller observes a truly idle agent.
                    let weak = Arc::downgrade(self);
                    let session = session.clone();
                    tokio::spawn(async move {
                        tokio::task::yield_now().await;
                        let Some(controller) = weak.upgrade() else {
                            return;
                        };
                        controller.continue_queued(&session).await;
                    });
                }
            }
        }
    }

    /// Re-acquire the session lock, mint a new run id, and continue the
    /// queued follow-ups.
    async fn continue_queued(self: &Arc<Self>, session_id: &str) {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        if self.agent.is_streaming() || !self.agent.has_queued_messages() {
            return;
        }
        let run_id = Uuid::new_v4().to_string();
        info!(session_id, run_id, "continuing queued follow-ups");
        self.set_binding(session_id, &run_id);
        self.agent.set_run_id(Some(run_id.clone()));

        let weak = Arc::downgrade(self);
        let agent = self.agent.clone();
        let session = session_id.to_owned();
        tokio::spawn(async move {
            if let Err(e) = agent.continue_run().await {
                if let Some(controller) = weak.upgrade() {
                    controller.fail_run(&session, &run_id, &e.to_string()).await;
                }
            }
        });
    }

    /// A failed prompt or continuation: persist the error and close the run.
    async fn fail_run(&self, session_id: &str, run_id: &str, message: &str) {
        error!(session_id, run_id, error = %message, "run failed");
        self.persist(
            session_id,
            run_id,
            EventType::Error,
            json!({ "message": message }),
        )
        .await;
        self.persist(
            session_id,
            run_id,
            EventType::RunClosed,
            json!({ "reason": "error" }),
        )
        .await;
        self.clear_binding(run_id);
        self.agent.set_run_id(None);
    }

    /// Append one row, logging instead of failing.
    async fn persist(
        &self,
        session_id: &str,
        run_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) {
        let result = self
            .events
            .append(NewEvent {
                session_id: session_id.to_owned(),
                event_type,
                payload,
                run_id: Some(run_id.to_owned()),
                dedupe_key: None,
            })
            .await;
        if let Err(e) = result {
            error!(session_id, run_id, %event_type, error = %e, "event persistence failed");
        }
    }

    // -----------------------------------------------------------------------
    // Bootstrap injection
    // -----------------------------------------------------------------------

    /// On the first user message process-wide, synthesise a tool round that
    /// reads the bootstrap workspace file. The claim is a DB upsert;
    /// concurrent first messages race benignly because losers skip it.
    async fn maybe_inject_bootstrap(&self, session_id: &str) {
        let Some(path) = self.config.bootstrap_file.clone() else {
            return;
        };
        let claimed = match self.events.claim_bootstrap(&self.config.agent_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(error = %e, "bootstrap claim failed");
                return;
            }
        };
        if !claimed {
            return;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bootstrap file unreadable; skipping injection");
                return;
            }
        };
        info!(session_id, path = %path.display(), "injecting bootstrap tool round");
        let call = self
            .events
            .append(NewEvent {
                session_id: session_id.to_owned(),
                event_type: EventType::ToolCall,
                payload: json!({
                    "name": "read_file",
                    "arguments": { "path": path.display().to_string() }
                }),
                run_id: None,
                dedupe_key: Some(BOOTSTRAP_TOOL_CALL_KEY.to_owned()),
            })
            .await;
        if let Err(e) = call {
            warn!(error = %e, "bootstrap tool_call append failed");
            return;
        }
        let result = self
            .events
            .append(NewEvent {
                session_id: session_id.to_owned(),
                event_type: EventType::ToolResult,
                payload: json!({ "name": "read_file", "content": content }),
                run_id: None,
                dedupe_key: Some(BOOTSTRAP_TOOL_RESULT_KEY.to_owned()),
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "bootstrap tool_result append failed");
        }
    }

    // -----------------------------------------------------------------------
    // Binding + locks
    // -----------------------------------------------------------------------

    fn session_lock(&self, session_id: &str) -> Arc<TokioMutex<()>> {
        let mut locks = self.session_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }

    fn current_binding(&self) -> Option<RunBinding> {
        self.binding.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_binding(&self, session_id: &str, run_id: &str) {
        *self.binding.lock().unwrap_or_else(|e| e.into_inner()) = Some(RunBinding {
            session_id: session_id.to_owned(),
            run_id: run_id.to_owned(),
        });
    }

    /// Clear the binding only if it still belongs to `run_id`; a newer run
    /// may already have replaced it.
    fn clear_binding(&self, run_id: &str) {
        let mut binding = self.binding.lock().unwrap_or_else(|e| e.into_inner());
        if binding.as_ref().is_some_and(|b| b.run_id == run_id) {
            *binding = None;
        }
    }
}

/// Pull the display text out of an agent message value: a string `content`,
/// or the concatenated `text` fields of a block list.
fn extract_text(message: &serde_json::Value) -> String {
    match message.get("content") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_handles_string_and_block_content() {
        assert_eq!(
            extract_text(&json!({ "role": "assistant", "content": "plain" })),
            "plain"
        );
        assert_eq!(
            extract_text(&json!({
                "role": "assistant",
                "content": [
                    { "type": "text", "text": "a" },
                    { "type": "tool_use", "name": "x" },
                    { "type": "text", "text": "b" }
                ]
            })),
            "ab"
        );
        assert_eq!(extract_text(&json!({ "role": "assistant" })), "");
    }
}
