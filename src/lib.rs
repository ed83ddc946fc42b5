//! mswdbg - client adapter for the MSW script-debugger wire protocol.
//!
//! The adapter drives a remote script debugger over one persistent TCP
//! connection: framed little-endian binary messages, asynchronous
//! request/response correlation on a shared socket, heartbeat and
//! idle-timeout lifecycle management, and a layered cache for the
//! hierarchical debug data of a paused debuggee (stack frames, scopes,
//! variables, nested variables).
//!
//! [`debugger::Debugger`] is the operation surface meant for editor
//! integration; [`session::Session`] and the [`proto`] codec sit below it
//! and are exposed for tooling that needs raw protocol access.

pub mod debugger;
pub mod error;
pub mod proto;
pub mod session;

pub use debugger::{Debugger, Evaluation, EventHook, StackTrace};
pub use error::Error;
pub use proto::{Breakpoint, Message, MessageType, Scope, StackFrame, Variable};
pub use session::{SessionConfig, DEFAULT_DEBUG_PORT, DEFAULT_HOST};
