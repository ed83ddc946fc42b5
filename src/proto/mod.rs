//! Message types and data model of the MSW debug wire protocol.
//!
//! Wire format of every frame:
//! [msg_type (1)][total_len:u32-LE (4)][payload...]
//!
//! `total_len` counts the whole frame including the 5-byte header. All
//! multi-byte integers are little-endian; strings are a `u32` byte length
//! followed by that many raw bytes (UTF-8, no terminator).

pub mod codec;

use strum_macros::FromRepr;

/// Size of the frame header: tag byte plus total length.
pub const HEADER_LEN: usize = 5;

/// Sentinel `variables_reference` meaning "no children".
pub const NO_CHILDREN: u32 = 0;

/// Wire tag of every message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
#[repr(u8)]
pub enum MessageType {
    Heartbeat = 0,
    AcceptConnection = 1,
    DenyConnection = 2,
    UpdateCallStack = 3,
    SetBreakpoints = 4,
    Continue = 5,
    StepOver = 6,
    StepInto = 7,
    StepOut = 8,
    FailureResponse = 9,
    ScopesRequest = 10,
    ScopesResponse = 11,
    VariablesRequest = 12,
    VariablesResponse = 13,
    EvaluateRequest = 14,
    EvaluateResponse = 15,
}

/// One entry of a call-stack snapshot, produced by the debuggee host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub id: u32,
    pub file_path: String,
    pub name: String,
    pub line: u32,
}

/// A named value observed at a paused execution state.
///
/// `variables_reference` other than [`NO_CHILDREN`] is an opaque handle the
/// host accepts in a later `VariablesRequest` to expand the children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub variables_reference: u32,
    pub r#type: String,
    pub value: String,
}

/// A named grouping of variables at one stack frame (locals, upvalues, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub name: String,
    pub variables_reference: u32,
    pub variables: Vec<Variable>,
}

/// A line breakpoint as reported back to the façade caller.
///
/// The wire protocol carries no per-line verification signal, so the façade
/// marks every breakpoint verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub verified: bool,
    pub line: u32,
}

/// Messages exchanged with the debuggee host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive, sent by both sides on a fixed interval. Fire-and-forget.
    Heartbeat,

    /// Host accepted the debug session.
    AcceptConnection,

    /// Host refused the debug session.
    DenyConnection,

    /// Wholesale replacement of the call-stack snapshot; sent by the host
    /// whenever execution pauses.
    UpdateCallStack {
        exec_space: String,
        frames: Vec<StackFrame>,
    },

    /// Replace the full breakpoint set of one file.
    SetBreakpoints { file_path: String, lines: Vec<u32> },

    /// Execution controls. No acknowledgement exists for these; the next
    /// observable effect is an `UpdateCallStack` or a teardown.
    Continue,
    StepOver,
    StepInto,
    StepOut,

    /// Host-side failure of the request identified by `request_id`.
    FailureResponse { request_id: u32, reason: String },

    ScopesRequest {
        request_id: u32,
        stack_frame_id: u32,
    },
    ScopesResponse {
        request_id: u32,
        scopes: Vec<Scope>,
    },

    /// Expand the children of an already observed variable. The host wants
    /// the full descriptor of the variable echoed back.
    VariablesRequest {
        request_id: u32,
        stack_frame_id: u32,
        variable: Variable,
    },
    VariablesResponse {
        request_id: u32,
        variables: Vec<Variable>,
    },

    EvaluateRequest {
        request_id: u32,
        stack_frame_id: u32,
        expression: String,
        line: u32,
        column: u32,
        context: String,
    },
    EvaluateResponse {
        request_id: u32,
        variable: Variable,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Heartbeat => MessageType::Heartbeat,
            Message::AcceptConnection => MessageType::AcceptConnection,
            Message::DenyConnection => MessageType::DenyConnection,
            Message::UpdateCallStack { .. } => MessageType::UpdateCallStack,
            Message::SetBreakpoints { .. } => MessageType::SetBreakpoints,
            Message::Continue => MessageType::Continue,
            Message::StepOver => MessageType::StepOver,
            Message::StepInto => MessageType::StepInto,
            Message::StepOut => MessageType::StepOut,
            Message::FailureResponse { .. } => MessageType::FailureResponse,
            Message::ScopesRequest { .. } => MessageType::ScopesRequest,
            Message::ScopesResponse { .. } => MessageType::ScopesResponse,
            Message::VariablesRequest { .. } => MessageType::VariablesRequest,
            Message::VariablesResponse { .. } => MessageType::VariablesResponse,
            Message::EvaluateRequest { .. } => MessageType::EvaluateRequest,
            Message::EvaluateResponse { .. } => MessageType::EvaluateResponse,
        }
    }

    /// Request id embedded in a response-type message, `None` for
    /// unsolicited message types.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            Message::FailureResponse { request_id, .. }
            | Message::ScopesResponse { request_id, .. }
            | Message::VariablesResponse { request_id, .. }
            | Message::EvaluateResponse { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }
}
