//! Debug façade: the public operation surface consumed by editor
//! integration code.
//!
//! The façade translates operations into protocol frames sent through the
//! [`Session`](crate::session::Session) and keeps the client-side picture
//! of the paused debuggee: the latest call-stack snapshot, the selected
//! frame and the variable-container cache. Operations that need the
//! network degrade to empty results while disconnected; callers are
//! expected to check [`Debugger::is_connected`] themselves.

mod cache;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::error::Error;
use crate::proto::{Breakpoint, Message, Scope, StackFrame, Variable, NO_CHILDREN};
use crate::session::{Notice, Session, SessionConfig};
use crate::weak_error;
use cache::VariableCache;

/// Callbacks fired on unsolicited session activity.
pub trait EventHook: Send + Sync + 'static {
    /// Execution paused and the host delivered a fresh call-stack snapshot.
    fn on_stopped(&self, exec_space: &str, frames: &[StackFrame]);
    /// The session ended: explicit disconnect, denied handshake, transport
    /// failure or idle timeout.
    fn on_terminated(&self);
}

/// A slice of the cached call-stack snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
    pub total_frames: usize,
}

/// Result of an expression evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub result: String,
    pub r#type: Option<String>,
    /// Non-zero when the result is expandable via [`Debugger::variables`].
    pub variables_reference: u32,
}

impl Evaluation {
    fn failure(reason: impl std::fmt::Display) -> Self {
        Evaluation {
            result: format!("<evaluation error: {reason}>"),
            r#type: None,
            variables_reference: NO_CHILDREN,
        }
    }

    fn empty() -> Self {
        Evaluation {
            result: String::new(),
            r#type: None,
            variables_reference: NO_CHILDREN,
        }
    }
}

struct Snapshot {
    exec_space: String,
    frames: Vec<StackFrame>,
}

#[derive(Default)]
struct State {
    handshake_done: bool,
    snapshot: Option<Snapshot>,
    selected_frame: Option<u32>,
    cache: VariableCache,
    /// Breakpoint sets registered before the handshake completed, flushed
    /// on `AcceptConnection`.
    pending_breakpoints: HashMap<String, Vec<u32>>,
}

/// Session storage shared with the notice pump. `connecting` guards the
/// window where a connect is in flight but no session exists yet;
/// `abort_connect` is raised by a disconnect arriving inside that window,
/// making the connect close its fresh session instead of installing it.
#[derive(Default)]
struct SessionSlot {
    session: Option<Session>,
    connecting: bool,
    abort_connect: bool,
}

/// The debugger façade. At most one session exists at a time; a new one may
/// be opened once the previous one is torn down.
pub struct Debugger<H: EventHook> {
    hooks: Arc<H>,
    config: SessionConfig,
    state: Arc<Mutex<State>>,
    session: Arc<Mutex<SessionSlot>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<H: EventHook> Debugger<H> {
    pub fn new(hooks: H) -> Self {
        Self::with_config(hooks, SessionConfig::default())
    }

    pub fn with_config(hooks: H, config: SessionConfig) -> Self {
        Self {
            hooks: Arc::new(hooks),
            config,
            state: Arc::new(Mutex::new(State::default())),
            session: Arc::new(Mutex::new(SessionSlot::default())),
        }
    }

    /// Open a session to the debuggee host. Fails with
    /// [`Error::AlreadyConnected`] while another session exists or another
    /// connect is in flight. A [`Debugger::disconnect`] arriving while the
    /// connect is in flight wins: the fresh session is closed and the call
    /// fails with [`Error::ConnectionClosed`]. Breakpoints registered
    /// before this call are flushed once the host accepts the session.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), Error> {
        {
            let mut slot = lock(&self.session);
            let live = slot.session.as_ref().is_some_and(|s| !s.is_closed());
            if live || slot.connecting {
                return Err(Error::AlreadyConnected);
            }
            slot.connecting = true;
            slot.abort_connect = false;
        }
        {
            let mut state = lock(&self.state);
            state.handshake_done = false;
            state.snapshot = None;
            state.selected_frame = None;
            state.cache.clear();
        }

        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let result = Session::connect(host, port, &self.config, notice_tx).await;

        // The guard drops and the session installs under one lock, leaving
        // no window where neither is visible to a concurrent connect.
        let mut slot = lock(&self.session);
        slot.connecting = false;
        let aborted = std::mem::take(&mut slot.abort_connect);
        let session = result?;
        if aborted {
            session.close();
            return Err(Error::ConnectionClosed);
        }
        slot.session = Some(session.clone());
        drop(slot);

        tokio::spawn(notice_pump(
            notice_rx,
            session,
            self.session.clone(),
            self.state.clone(),
            self.hooks.clone(),
        ));
        Ok(())
    }

    /// Tear down the current session, if any. Idempotent; `on_terminated`
    /// fires even when already disconnected.
    pub fn disconnect(&self) {
        {
            let mut slot = lock(&self.session);
            if slot.connecting {
                slot.abort_connect = true;
            }
            if let Some(session) = slot.session.take() {
                session.close();
            }
        }
        let mut state = lock(&self.state);
        state.handshake_done = false;
        state.snapshot = None;
        state.selected_frame = None;
        state.cache.clear();
        state.pending_breakpoints.clear();
        drop(state);
        self.hooks.on_terminated();
    }

    pub fn is_connected(&self) -> bool {
        self.live_session().is_some()
    }

    /// Replace the breakpoint set of one file. Before the handshake
    /// completes the set is stored and flushed on `AcceptConnection`.
    ///
    /// Every returned breakpoint is marked verified: the protocol carries
    /// no per-line verification signal, a known limitation.
    pub async fn set_breakpoints(&self, file_path: &str, lines: Vec<u32>) -> Vec<Breakpoint> {
        let breakpoints = lines
            .iter()
            .map(|&line| Breakpoint {
                verified: true,
                line,
            })
            .collect();

        let handshake_done = lock(&self.state).handshake_done;
        match self.live_session().filter(|_| handshake_done) {
            Some(session) => {
                weak_error!(
                    session
                        .send(&Message::SetBreakpoints {
                            file_path: file_path.to_string(),
                            lines,
                        })
                        .await
                );
            }
            None => {
                lock(&self.state)
                    .pending_breakpoints
                    .insert(file_path.to_string(), lines);
            }
        }
        breakpoints
    }

    /// Resume execution. Fire-and-forget: the protocol has no
    /// acknowledgement for control frames, the next observable effect is an
    /// `on_stopped` or `on_terminated` callback.
    pub async fn continue_run(&self) {
        self.fire(Message::Continue).await;
    }

    pub async fn step_over(&self) {
        self.fire(Message::StepOver).await;
    }

    pub async fn step_into(&self) {
        self.fire(Message::StepInto).await;
    }

    pub async fn step_out(&self) {
        self.fire(Message::StepOut).await;
    }

    async fn fire(&self, msg: Message) {
        let Some(session) = self.live_session() else {
            return;
        };
        weak_error!(session.send(&msg).await);
    }

    /// Slice `[start_frame, start_frame + max_levels)` of the last cached
    /// call-stack snapshot. Never touches the network; empty before the
    /// first `UpdateCallStack`.
    pub fn stack_trace(&self, start_frame: Option<usize>, max_levels: Option<usize>) -> StackTrace {
        let state = lock(&self.state);
        let Some(snapshot) = &state.snapshot else {
            return StackTrace::default();
        };
        let total_frames = snapshot.frames.len();
        let start = start_frame.unwrap_or(0).min(total_frames);
        let end = max_levels
            .map_or(total_frames, |max| start.saturating_add(max))
            .min(total_frames);
        StackTrace {
            frames: snapshot.frames[start..end].to_vec(),
            total_frames,
        }
    }

    /// Execution-space label of the last snapshot, if any.
    pub fn exec_space(&self) -> Option<String> {
        lock(&self.state)
            .snapshot
            .as_ref()
            .map(|s| s.exec_space.clone())
    }

    /// Fetch the scopes of a stack frame and remember the frame as
    /// selected. Every scope and every variable inside it lands in the
    /// container cache. A failure yields an empty list and a warning.
    pub async fn scopes(&self, frame_id: u32) -> Vec<Scope> {
        let Some(session) = self.live_session() else {
            return vec![];
        };
        let epoch = {
            let mut state = lock(&self.state);
            state.selected_frame = Some(frame_id);
            state.cache.epoch()
        };

        let response = session
            .request(|request_id| Message::ScopesRequest {
                request_id,
                stack_frame_id: frame_id,
            })
            .await;

        match response {
            Ok(Message::ScopesResponse { scopes, .. }) => {
                let mut state = lock(&self.state);
                for scope in &scopes {
                    state.cache.insert_container(
                        epoch,
                        Variable {
                            name: scope.name.clone(),
                            variables_reference: scope.variables_reference,
                            r#type: String::new(),
                            value: String::new(),
                        },
                        Some(scope.variables.clone()),
                    );
                    for var in &scope.variables {
                        if var.variables_reference != NO_CHILDREN {
                            state.cache.insert(epoch, var.clone());
                        }
                    }
                }
                scopes
            }
            Ok(other) => {
                log::warn!(
                    target: "debugger",
                    "unexpected response to scopes request: {:?}",
                    other.message_type()
                );
                vec![]
            }
            Err(e) => {
                log::warn!(target: "debugger", "scopes request failed: {e:#}");
                vec![]
            }
        }
    }

    /// Expand the children of a previously observed container reference.
    ///
    /// Cached children are returned without network I/O; a reference that
    /// was never observed yields an empty list without contacting the host.
    /// Children are fetched one level deep, grandchildren lazily on their
    /// own later call.
    pub async fn variables(&self, reference: u32) -> Vec<Variable> {
        if reference == NO_CHILDREN {
            return vec![];
        }

        let (descriptor, epoch, frame_id) = {
            let state = lock(&self.state);
            if let Some(children) = state.cache.children(reference) {
                return children;
            }
            let Some(descriptor) = state.cache.descriptor(reference) else {
                // A reference can only be expanded after its parent was
                // observed in a scopes/variables/evaluate response.
                return vec![];
            };
            (
                descriptor,
                state.cache.epoch(),
                state.selected_frame.unwrap_or(0),
            )
        };

        let Some(session) = self.live_session() else {
            return vec![];
        };

        let response = session
            .request(|request_id| Message::VariablesRequest {
                request_id,
                stack_frame_id: frame_id,
                variable: descriptor,
            })
            .await;

        match response {
            Ok(Message::VariablesResponse { variables, .. }) => {
                let mut state = lock(&self.state);
                state.cache.set_children(epoch, reference, variables.clone());
                for var in &variables {
                    if var.variables_reference != NO_CHILDREN {
                        state.cache.insert(epoch, var.clone());
                    }
                }
                variables
            }
            Ok(other) => {
                log::warn!(
                    target: "debugger",
                    "unexpected response to variables request: {:?}",
                    other.message_type()
                );
                vec![]
            }
            Err(e) => {
                log::warn!(target: "debugger", "variables request failed: {e:#}");
                vec![]
            }
        }
    }

    /// Evaluate an expression in the context of a frame (the selected frame
    /// when none is given). A successful result with a non-zero reference
    /// is cached and immediately expandable; a failure comes back as an
    /// error-prefixed result string with a zero reference.
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<u32>,
        context: Option<&str>,
    ) -> Evaluation {
        let Some(session) = self.live_session() else {
            return Evaluation::empty();
        };
        let (epoch, selected) = {
            let state = lock(&self.state);
            (state.cache.epoch(), state.selected_frame.unwrap_or(0))
        };
        let stack_frame_id = frame_id.unwrap_or(selected);
        let context = context.unwrap_or("repl").to_string();
        let expression = expression.to_string();

        let response = session
            .request(|request_id| Message::EvaluateRequest {
                request_id,
                stack_frame_id,
                expression,
                line: 0,
                column: 0,
                context,
            })
            .await;

        match response {
            Ok(Message::EvaluateResponse { variable, .. }) => {
                if variable.variables_reference != NO_CHILDREN {
                    lock(&self.state).cache.insert(epoch, variable.clone());
                }
                Evaluation {
                    result: variable.value,
                    r#type: (!variable.r#type.is_empty()).then_some(variable.r#type),
                    variables_reference: variable.variables_reference,
                }
            }
            Ok(other) => {
                log::warn!(
                    target: "debugger",
                    "unexpected response to evaluate request: {:?}",
                    other.message_type()
                );
                Evaluation::failure("unexpected response")
            }
            Err(Error::Request(reason)) => Evaluation::failure(reason),
            Err(e) => {
                log::warn!(target: "debugger", "evaluate request failed: {e:#}");
                Evaluation::failure(e)
            }
        }
    }

    fn live_session(&self) -> Option<Session> {
        lock(&self.session)
            .session
            .as_ref()
            .filter(|s| !s.is_closed())
            .cloned()
    }
}

/// Consumes session notices in arrival order. Frame-dispatch mutations of
/// the snapshot and the cache happen here, never concurrently with another
/// writer.
async fn notice_pump<H: EventHook>(
    mut notices: mpsc::UnboundedReceiver<Notice>,
    session: Session,
    slot: Arc<Mutex<SessionSlot>>,
    state: Arc<Mutex<State>>,
    hooks: Arc<H>,
) {
    while let Some(notice) = notices.recv().await {
        match notice {
            Notice::Accepted => {
                log::info!(target: "debugger", "debug session accepted by host");
                let pending: Vec<(String, Vec<u32>)> = {
                    let mut state = lock(&state);
                    state.handshake_done = true;
                    state.pending_breakpoints.drain().collect()
                };
                for (file_path, lines) in pending {
                    weak_error!(
                        session
                            .send(&Message::SetBreakpoints { file_path, lines })
                            .await
                    );
                }
            }
            Notice::Denied => {
                log::warn!(target: "debugger", "debug session denied by host");
                session.close();
                lock(&slot).session = None;
                hooks.on_terminated();
                break;
            }
            Notice::StackUpdate { exec_space, frames } => {
                {
                    let mut state = lock(&state);
                    // Referenced values belong to the previous paused
                    // state; the whole cache dies with it.
                    state.cache.clear();
                    state.selected_frame = None;
                    state.snapshot = Some(Snapshot {
                        exec_space: exec_space.clone(),
                        frames: frames.clone(),
                    });
                }
                hooks.on_stopped(&exec_space, &frames);
            }
            Notice::Closed(err) => {
                log::warn!(target: "debugger", "session terminated: {err:#}");
                lock(&slot).session = None;
                lock(&state).handshake_done = false;
                hooks.on_terminated();
                break;
            }
        }
    }
}
