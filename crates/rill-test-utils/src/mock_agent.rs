//! A scripted agent for controller tests.
//!
//! `prompt` runs one deterministic turn: agent/turn start, a streamed
//! assistant message, optionally a tool round, then turn end and agent
//! end. A held agent pauses mid-stream until `release` so tests can
//! observe the streaming state (and exercise follow-up routing);
//! `continue_run` drains queued follow-ups in one fresh run.

use async_trait::async_trait;
use rill_server::agent::{Agent, AgentError, AgentEvent};
use serde_json::{json, Value};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;

#[derive(Default)]
struct Inner {
    streaming: bool,
    queued: Vec<String>,
    messages: Vec<Value>,
    run_id: Option<String>,
    tx: Option<UnboundedSender<AgentEvent>>,
    hold: bool,
    tool_round: bool,
    orphan_follow_ups: bool,
    fail_next_prompt: Option<String>,
    steered: Vec<String>,
}

pub struct MockAgent {
    inner: StdMutex<Inner>,
    gate: Semaphore,
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgent {
    pub fn new() -> Self {
        MockAgent {
            inner: StdMutex::new(Inner::default()),
            gate: Semaphore::new(0),
        }
    }

    /// Make the next runs pause mid-stream until `release`.
    pub fn hold(&self) {
        self.lock().hold = true;
    }

    /// Resume a held run and stop holding future turns.
    pub fn release(&self) {
        self.lock().hold = false;
        self.gate.add_permits(1);
    }

    /// Emit a tool execution round inside each turn.
    pub fn with_tool_round(&self) {
        self.lock().tool_round = true;
    }

    /// Skip the internal queue drain before `agent_end`, leaving queued
    /// follow-ups orphaned for the controller's continuation path.
    pub fn orphan_follow_ups(&self) {
        self.lock().orphan_follow_ups = true;
    }

    /// Fail the next `prompt` with this message instead of running.
    pub fn fail_next_prompt(&self, message: &str) {
        self.lock().fail_next_prompt = Some(message.to_owned());
    }

    pub fn steered(&self) -> Vec<String> {
        self.lock().steered.clone()
    }

    pub fn run_id(&self) -> Option<String> {
        self.lock().run_id.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: AgentEvent) {
        let tx = self.lock().tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event);
        }
    }

    /// One scripted turn answering `text`.
    async fn run_turn(&self, text: &str) {
        let (hold, tool_round) = {
            let mut inner = self.lock();
            inner.messages.push(json!({ "role": "user", "content": text }));
            (inner.hold, inner.tool_round)
        };

        self.emit(AgentEvent::TurnStart);

        if tool_round {
            let call_id = format!("call-{}", self.lock().messages.len());
            self.emit(AgentEvent::ToolExecutionStart {
                tool_call_id: call_id.clone(),
                name: "lookup".to_owned(),
                arguments: json!({ "query": text }),
            });
            self.emit(AgentEvent::ToolExecutionUpdate {
                tool_call_id: call_id.clone(),
                output: json!({ "progress": 1.0 }),
            });
            self.emit(AgentEvent::ToolExecutionEnd {
                tool_call_id: call_id,
                name: "lookup".to_owned(),
                result: json!({ "found": true }),
            });
        }

        let reply = format!("echo: {text}");
        self.emit(AgentEvent::MessageStart {
            message: json!({ "role": "assistant", "content": "" }),
        });
        self.emit(AgentEvent::MessageUpdate {
            delta: json!({ "text": reply }),
        });

        if hold {
            // Parked until the test calls release().
            let permit = self.gate.acquire().await;
            permit.expect("gate semaphore closed").forget();
        }

        let message = json!({ "role": "assistant", "content": reply });
        self.lock().messages.push(message.clone());
        self.emit(AgentEvent::MessageEnd { message });
        self.emit(AgentEvent::TurnEnd);
    }

    async fn run(&self, texts: Vec<String>) -> Result<(), AgentError> {
        self.lock().streaming = true;
        self.emit(AgentEvent::AgentStart);
        for text in &texts {
            self.run_turn(text).await;
        }
        // The internal queue check: drain follow-ups that arrived while
        // streaming, unless the test wants them orphaned.
        if !self.lock().orphan_follow_ups {
            loop {
                let queued = std::mem::take(&mut self.lock().queued);
                if queued.is_empty() {
                    break;
                }
                for text in &queued {
                    self.run_turn(text).await;
                }
            }
        }
        let messages = self.lock().messages.clone();
        // agent_end fires while the loop still counts as streaming; the
        // flag clears just after, like a finally block would.
        self.emit(AgentEvent::AgentEnd { messages });
        self.lock().streaming = false;
        Ok(())
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    fn has_queued_messages(&self) -> bool {
        !self.lock().queued.is_empty()
    }

    fn system_prompt(&self) -> String {
        "You are a scripted test agent.".to_owned()
    }

    fn messages(&self) -> Vec<Value> {
        self.lock().messages.clone()
    }

    fn replace_messages(&self, messages: Vec<Value>) {
        self.lock().messages = messages;
    }

    fn set_run_id(&self, run_id: Option<String>) {
        self.lock().run_id = run_id;
    }

    fn subscribe(&self, tx: UnboundedSender<AgentEvent>) {
        self.lock().tx = Some(tx);
    }

    async fn prompt(&self, text: &str) -> Result<(), AgentError> {
        if let Some(message) = self.lock().fail_next_prompt.take() {
            return Err(AgentError::Failed(message));
        }
        self.run(vec![text.to_owned()]).await
    }

    async fn follow_up(&self, text: &str) -> Result<(), AgentError> {
        self.lock().queued.push(text.to_owned());
        Ok(())
    }

    async fn continue_run(&self) -> Result<(), AgentError> {
        let queued = std::mem::take(&mut self.lock().queued);
        self.run(queued).await
    }

    async fn steer(&self, text: &str) -> Result<(), AgentError> {
        self.lock().steered.push(text.to_owned());
        Ok(())
    }

    async fn abort(&self) {
        {
            let mut inner = self.lock();
            inner.queued.clear();
            inner.hold = false;
        }
        self.release();
    }
}
