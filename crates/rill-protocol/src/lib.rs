// rill-protocol: wire-level types shared by the stream server and its tests.
//
// Everything here is part of the frozen HTTP protocol surface: composite
// offsets, protocol header names, producer fence results, and the run-layer
// event type enum.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Composite stream offsets
// ---------------------------------------------------------------------------

/// A composite stream offset: `(read_seq, byte_offset)`.
///
/// Rendered as `{16-digit read_seq}_{16-digit byte_offset}` so that the
/// string ordering of rendered offsets equals their logical ordering.
/// `read_seq` is the high-order key; it increases on every resurrection, so
/// offsets from an old incarnation always compare below offsets from a new
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamOffset {
    pub read_seq: u64,
    pub byte_offset: u64,
}

impl StreamOffset {
    pub const ZERO: StreamOffset = StreamOffset {
        read_seq: 0,
        byte_offset: 0,
    };

    pub fn new(read_seq: u64, byte_offset: u64) -> Self {
        StreamOffset {
            read_seq,
            byte_offset,
        }
    }
}

impl fmt::Display for StreamOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016}_{:016}", self.read_seq, self.byte_offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed stream offset: {0:?}")]
pub struct OffsetParseError(pub String);

impl FromStr for StreamOffset {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || OffsetParseError(s.to_owned());
        let (seq, off) = s.split_once('_').ok_or_else(bad)?;
        if seq.len() != 16 || off.len() != 16 {
            return Err(bad());
        }
        let read_seq: u64 = seq.parse().map_err(|_| bad())?;
        let byte_offset: u64 = off.parse().map_err(|_| bad())?;
        Ok(StreamOffset {
            read_seq,
            byte_offset,
        })
    }
}

impl TryFrom<String> for StreamOffset {
    type Error = OffsetParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StreamOffset> for String {
    fn from(o: StreamOffset) -> String {
        o.to_string()
    }
}

/// Where a read should start, as carried in the `offset` query parameter.
///
/// `-1` means from the beginning, `now` means at the current tail, anything
/// else must parse as a literal [`StreamOffset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    Beginning,
    Tail,
    After(StreamOffset),
}

impl FromStr for ReadPosition {
    type Err = OffsetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "-1" => Ok(ReadPosition::Beginning),
            "now" => Ok(ReadPosition::Tail),
            other => Ok(ReadPosition::After(other.parse()?)),
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol header names
// ---------------------------------------------------------------------------

/// Header names used by the stream protocol. All are matched
/// case-insensitively on the wire; the lowercase forms here are also the
/// forms exposed across CORS.
pub mod headers {
    pub const STREAM_NEXT_OFFSET: &str = "stream-next-offset";
    pub const STREAM_CURSOR: &str = "stream-cursor";
    pub const STREAM_UP_TO_DATE: &str = "stream-up-to-date";
    pub const STREAM_CLOSED: &str = "stream-closed";
    pub const STREAM_TTL: &str = "stream-ttl";
    pub const STREAM_EXPIRES_AT: &str = "stream-expires-at";
    pub const STREAM_SSE_DATA_ENCODING: &str = "stream-sse-data-encoding";
    pub const PRODUCER_ID: &str = "producer-id";
    pub const PRODUCER_EPOCH: &str = "producer-epoch";
    pub const PRODUCER_SEQ: &str = "producer-seq";
    pub const PRODUCER_EXPECTED_SEQ: &str = "producer-expected-seq";
    pub const PRODUCER_RECEIVED_SEQ: &str = "producer-received-seq";

    /// Response headers a browser client is allowed to read.
    pub const EXPOSED: &[&str] = &[
        STREAM_NEXT_OFFSET,
        STREAM_CURSOR,
        STREAM_UP_TO_DATE,
        STREAM_CLOSED,
        PRODUCER_EPOCH,
        PRODUCER_SEQ,
        PRODUCER_EXPECTED_SEQ,
        PRODUCER_RECEIVED_SEQ,
        "etag",
        "content-type",
        "content-encoding",
        "vary",
    ];
}

// ---------------------------------------------------------------------------
// Producer fencing
// ---------------------------------------------------------------------------

/// The `(id, epoch, seq)` triple carried by idempotent producers.
///
/// All three headers must be present together; a partial triple is a
/// malformed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerFence {
    pub producer_id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Outcome of a successfully handled producer append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// The append was durably accepted at `(epoch, seq)`.
    Accepted { epoch: u64, seq: u64 },
    /// The `(epoch, seq)` was already accepted earlier; no new message was
    /// written. `seq` echoes the stored high-water mark.
    Duplicate { epoch: u64, seq: u64 },
}

/// Producer validation failures. Each maps to a distinct HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerRejection {
    #[error("stale epoch (current epoch {current_epoch})")]
    StaleEpoch { current_epoch: u64 },
    #[error("a new epoch must start at seq 0")]
    InvalidEpochSeq,
    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },
    #[error("stream is closed")]
    StreamClosed { current_offset: StreamOffset },
}

// ---------------------------------------------------------------------------
// Run-layer event types
// ---------------------------------------------------------------------------

/// The closed set of event type tags persisted by the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserMessage,
    AssistantStart,
    AssistantFinal,
    ToolCall,
    ToolResult,
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    RunClosed,
    Error,
    MessageStart,
    MessageUpdate,
    MessageEnd,
    ToolExecutionStart,
    ToolExecutionUpdate,
    ToolExecutionEnd,
}

impl EventType {
    pub const ALL: &'static [EventType] = &[
        EventType::UserMessage,
        EventType::AssistantStart,
        EventType::AssistantFinal,
        EventType::ToolCall,
        EventType::ToolResult,
        EventType::AgentStart,
        EventType::AgentEnd,
        EventType::TurnStart,
        EventType::TurnEnd,
        EventType::RunClosed,
        EventType::Error,
        EventType::MessageStart,
        EventType::MessageUpdate,
        EventType::MessageEnd,
        EventType::ToolExecutionStart,
        EventType::ToolExecutionUpdate,
        EventType::ToolExecutionEnd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::UserMessage => "user_message",
            EventType::AssistantStart => "assistant_start",
            EventType::AssistantFinal => "assistant_final",
            EventType::ToolCall => "tool_call",
            EventType::ToolResult => "tool_result",
            EventType::AgentStart => "agent_start",
            EventType::AgentEnd => "agent_end",
            EventType::TurnStart => "turn_start",
            EventType::TurnEnd => "turn_end",
            EventType::RunClosed => "run_closed",
            EventType::Error => "error",
            EventType::MessageStart => "message_start",
            EventType::MessageUpdate => "message_update",
            EventType::MessageEnd => "message_end",
            EventType::ToolExecutionStart => "tool_execution_start",
            EventType::ToolExecutionUpdate => "tool_execution_update",
            EventType::ToolExecutionEnd => "tool_execution_end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0:?}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_owned()))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
