//! The agent seam.
//!
//! The run controller owns an opaque agent: an external collaborator that
//! streams a typed event sequence while it works. The trait below is the
//! whole contract; the production adapter and the scripted test double both
//! implement it. Events are delivered over an unbounded channel handed to
//! the agent via `subscribe`.

pub mod controller;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// The typed event stream an agent emits while running.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    AgentEnd {
        /// The agent's message list at the end of the run.
        messages: Vec<serde_json::Value>,
    },
    TurnStart,
    TurnEnd,
    MessageStart {
        /// The in-progress message.
        message: serde_json::Value,
    },
    MessageUpdate {
        /// The stream delta, not the accumulated text.
        delta: serde_json::Value,
    },
    MessageEnd {
        message: serde_json::Value,
    },
    ToolExecutionStart {
        tool_call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        output: serde_json::Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        name: String,
        result: serde_json::Value,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("agent failure: {0}")]
    Failed(String),
}

/// An opaque conversational agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// True while a run is streaming.
    fn is_streaming(&self) -> bool;

    /// True when follow-up messages are queued behind the current run.
    fn has_queued_messages(&self) -> bool;

    fn system_prompt(&self) -> String;

    /// The agent's current message list.
    fn messages(&self) -> Vec<serde_json::Value>;

    fn replace_messages(&self, messages: Vec<serde_json::Value>);

    /// Stamp (or clear) the run id subsequent events belong to.
    fn set_run_id(&self, run_id: Option<String>);

    /// Install the event channel. Called once by the controller.
    fn subscribe(&self, tx: mpsc::UnboundedSender<AgentEvent>);

    /// Start a run for `text`. Resolves when the run finishes.
    async fn prompt(&self, text: &str) -> Result<(), AgentError>;

    /// Enqueue a follow-up behind the current run.
    async fn follow_up(&self, text: &str) -> Result<(), AgentError>;

    /// Drain queued follow-ups in a fresh run. Resolves when it finishes.
    async fn continue_run(&self) -> Result<(), AgentError>;

    /// Redirect the in-flight run.
    async fn steer(&self, text: &str) -> Result<(), AgentError>;

    /// Abort the in-flight run.
    async fn abort(&self);
}
