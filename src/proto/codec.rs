//! Deterministic encode/decode of protocol frames.
//!
//! The codec never performs I/O: encoding produces a complete frame as a
//! byte vector, decoding consumes a complete in-memory payload span. Any
//! length-prefixed field whose declared length would read past the payload
//! makes the whole frame malformed, which the session treats as fatal.

use bytes::BufMut;

use super::{Message, MessageType, Scope, StackFrame, Variable, HEADER_LEN};
use crate::error::Error;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_type: MessageType,
    pub total_len: u32,
}

impl Header {
    /// Decode a header from the first [`HEADER_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Header, Error> {
        debug_assert!(buf.len() >= HEADER_LEN);
        let tag = buf[0];
        let message_type = MessageType::from_repr(tag).ok_or(Error::UnknownTag(tag))?;
        let total_len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if (total_len as usize) < HEADER_LEN {
            return Err(Error::FrameTooShort(total_len));
        }
        Ok(Header {
            message_type,
            total_len,
        })
    }
}

/// Outbound frame under construction. The total length is back-patched into
/// the header on [`FrameBuilder::finish`].
struct FrameBuilder {
    buf: Vec<u8>,
}

impl FrameBuilder {
    fn new(message_type: MessageType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(message_type as u8);
        buf.put_u32_le(0);
        FrameBuilder { buf }
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    fn put_string(&mut self, value: &str) {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    fn put_variable(&mut self, variable: &Variable) {
        self.put_string(&variable.name);
        self.put_u32(variable.variables_reference);
        self.put_string(&variable.r#type);
        self.put_string(&variable.value);
    }

    fn finish(mut self) -> Vec<u8> {
        let total_len = self.buf.len() as u32;
        self.buf[1..HEADER_LEN].copy_from_slice(&total_len.to_le_bytes());
        self.buf
    }
}

/// Bounds-checked cursor over one frame payload.
struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FrameReader { buf, pos: 0 }
    }

    fn take_u32(&mut self) -> Result<u32, Error> {
        if self.pos + 4 > self.buf.len() {
            return Err(Error::MalformedFrame("u32 field exceeds payload"));
        }
        let bytes = [
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ];
        self.pos += 4;
        Ok(u32::from_le_bytes(bytes))
    }

    fn take_string(&mut self) -> Result<String, Error> {
        let len = self.take_u32()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(Error::MalformedFrame("string length exceeds payload"));
        }
        let raw = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(String::from_utf8(raw)?)
    }

    fn take_variable(&mut self) -> Result<Variable, Error> {
        Ok(Variable {
            name: self.take_string()?,
            variables_reference: self.take_u32()?,
            r#type: self.take_string()?,
            value: self.take_string()?,
        })
    }
}

impl Message {
    /// Encode the message into one complete frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = FrameBuilder::new(self.message_type());
        match self {
            Message::Heartbeat
            | Message::AcceptConnection
            | Message::DenyConnection
            | Message::Continue
            | Message::StepOver
            | Message::StepInto
            | Message::StepOut => {}

            Message::UpdateCallStack { exec_space, frames } => {
                frame.put_string(exec_space);
                frame.put_u32(frames.len() as u32);
                for f in frames {
                    frame.put_string(&f.file_path);
                    frame.put_u32(f.id);
                    frame.put_string(&f.name);
                    frame.put_u32(f.line);
                }
            }
            Message::SetBreakpoints { file_path, lines } => {
                frame.put_string(file_path);
                frame.put_u32(lines.len() as u32);
                for line in lines {
                    frame.put_u32(*line);
                }
            }
            Message::FailureResponse { request_id, reason } => {
                frame.put_u32(*request_id);
                frame.put_string(reason);
            }
            Message::ScopesRequest {
                request_id,
                stack_frame_id,
            } => {
                frame.put_u32(*request_id);
                frame.put_u32(*stack_frame_id);
            }
            Message::ScopesResponse { request_id, scopes } => {
                frame.put_u32(*request_id);
                frame.put_u32(scopes.len() as u32);
                for scope in scopes {
                    frame.put_string(&scope.name);
                    frame.put_u32(scope.variables_reference);
                    frame.put_u32(scope.variables.len() as u32);
                    for var in &scope.variables {
                        frame.put_variable(var);
                    }
                }
            }
            Message::VariablesRequest {
                request_id,
                stack_frame_id,
                variable,
            } => {
                frame.put_u32(*request_id);
                frame.put_u32(*stack_frame_id);
                frame.put_variable(variable);
            }
            Message::VariablesResponse {
                request_id,
                variables,
            } => {
                frame.put_u32(*request_id);
                frame.put_u32(variables.len() as u32);
                for var in variables {
                    frame.put_variable(var);
                }
            }
            Message::EvaluateRequest {
                request_id,
                stack_frame_id,
                expression,
                line,
                column,
                context,
            } => {
                frame.put_u32(*request_id);
                frame.put_u32(*stack_frame_id);
                frame.put_string(expression);
                frame.put_u32(*line);
                frame.put_u32(*column);
                frame.put_string(context);
            }
            Message::EvaluateResponse {
                request_id,
                variable,
            } => {
                frame.put_u32(*request_id);
                frame.put_variable(variable);
            }
        }
        frame.finish()
    }

    /// Decode a message of an already identified type from its payload (the
    /// frame bytes after the header).
    ///
    /// Bytes past the last field are tolerated; a field that overruns the
    /// payload is not.
    pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Message, Error> {
        let mut r = FrameReader::new(payload);
        let msg = match message_type {
            MessageType::Heartbeat => Message::Heartbeat,
            MessageType::AcceptConnection => Message::AcceptConnection,
            MessageType::DenyConnection => Message::DenyConnection,
            MessageType::Continue => Message::Continue,
            MessageType::StepOver => Message::StepOver,
            MessageType::StepInto => Message::StepInto,
            MessageType::StepOut => Message::StepOut,

            MessageType::UpdateCallStack => {
                let exec_space = r.take_string()?;
                let count = r.take_u32()? as usize;
                let mut frames = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let file_path = r.take_string()?;
                    let id = r.take_u32()?;
                    let name = r.take_string()?;
                    let line = r.take_u32()?;
                    frames.push(StackFrame {
                        id,
                        file_path,
                        name,
                        line,
                    });
                }
                Message::UpdateCallStack { exec_space, frames }
            }
            MessageType::SetBreakpoints => {
                let file_path = r.take_string()?;
                let count = r.take_u32()? as usize;
                let mut lines = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    lines.push(r.take_u32()?);
                }
                Message::SetBreakpoints { file_path, lines }
            }
            MessageType::FailureResponse => Message::FailureResponse {
                request_id: r.take_u32()?,
                reason: r.take_string()?,
            },
            MessageType::ScopesRequest => Message::ScopesRequest {
                request_id: r.take_u32()?,
                stack_frame_id: r.take_u32()?,
            },
            MessageType::ScopesResponse => {
                let request_id = r.take_u32()?;
                let count = r.take_u32()? as usize;
                let mut scopes = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let name = r.take_string()?;
                    let variables_reference = r.take_u32()?;
                    let var_count = r.take_u32()? as usize;
                    let mut variables = Vec::with_capacity(var_count.min(1024));
                    for _ in 0..var_count {
                        variables.push(r.take_variable()?);
                    }
                    scopes.push(Scope {
                        name,
                        variables_reference,
                        variables,
                    });
                }
                Message::ScopesResponse { request_id, scopes }
            }
            MessageType::VariablesRequest => Message::VariablesRequest {
                request_id: r.take_u32()?,
                stack_frame_id: r.take_u32()?,
                variable: r.take_variable()?,
            },
            MessageType::VariablesResponse => {
                let request_id = r.take_u32()?;
                let count = r.take_u32()? as usize;
                let mut variables = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    variables.push(r.take_variable()?);
                }
                Message::VariablesResponse {
                    request_id,
                    variables,
                }
            }
            MessageType::EvaluateRequest => Message::EvaluateRequest {
                request_id: r.take_u32()?,
                stack_frame_id: r.take_u32()?,
                expression: r.take_string()?,
                line: r.take_u32()?,
                column: r.take_u32()?,
                context: r.take_string()?,
            },
            MessageType::EvaluateResponse => Message::EvaluateResponse {
                request_id: r.take_u32()?,
                variable: r.take_variable()?,
            },
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::NO_CHILDREN;

    fn var(name: &str, reference: u32, r#type: &str, value: &str) -> Variable {
        Variable {
            name: name.to_string(),
            variables_reference: reference,
            r#type: r#type.to_string(),
            value: value.to_string(),
        }
    }

    fn round_trip(msg: Message) {
        let encoded = msg.encode();
        let header = Header::decode(&encoded[..HEADER_LEN]).unwrap();
        assert_eq!(header.message_type, msg.message_type());
        assert_eq!(header.total_len as usize, encoded.len());
        let decoded = Message::decode(header.message_type, &encoded[HEADER_LEN..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_round_trip_bodyless_messages() {
        round_trip(Message::Heartbeat);
        round_trip(Message::AcceptConnection);
        round_trip(Message::DenyConnection);
        round_trip(Message::Continue);
        round_trip(Message::StepOver);
        round_trip(Message::StepInto);
        round_trip(Message::StepOut);
    }

    #[test]
    fn test_round_trip_update_call_stack() {
        round_trip(Message::UpdateCallStack {
            exec_space: "Server".to_string(),
            frames: vec![
                StackFrame {
                    id: 0x01020304,
                    file_path: "scripts/main.mlua".to_string(),
                    name: "OnUpdate".to_string(),
                    line: 42,
                },
                StackFrame {
                    id: 2,
                    file_path: String::new(),
                    name: String::new(),
                    line: 0,
                },
            ],
        });
        // Empty snapshot and empty exec space.
        round_trip(Message::UpdateCallStack {
            exec_space: String::new(),
            frames: vec![],
        });
    }

    #[test]
    fn test_round_trip_breakpoints_and_controls() {
        round_trip(Message::SetBreakpoints {
            file_path: "a.mlua".to_string(),
            lines: vec![5, 10, 16909060],
        });
        round_trip(Message::SetBreakpoints {
            file_path: "empty.mlua".to_string(),
            lines: vec![],
        });
    }

    #[test]
    fn test_round_trip_requests_and_responses() {
        round_trip(Message::FailureResponse {
            request_id: 7,
            reason: "no such frame".to_string(),
        });
        round_trip(Message::ScopesRequest {
            request_id: 16909060,
            stack_frame_id: 3,
        });
        round_trip(Message::ScopesResponse {
            request_id: 1,
            scopes: vec![
                Scope {
                    name: "Locals".to_string(),
                    variables_reference: 100,
                    variables: vec![
                        var("self", 101, "table", "{...}"),
                        var("count", NO_CHILDREN, "number", "3"),
                    ],
                },
                Scope {
                    name: "Upvalues".to_string(),
                    variables_reference: 102,
                    variables: vec![],
                },
            ],
        });
        round_trip(Message::VariablesRequest {
            request_id: 2,
            stack_frame_id: 0,
            variable: var("self", 101, "table", "{...}"),
        });
        round_trip(Message::VariablesResponse {
            request_id: 2,
            variables: vec![var("x", NO_CHILDREN, "number", "1.5"), var("", 0, "", "")],
        });
        round_trip(Message::EvaluateRequest {
            request_id: 3,
            stack_frame_id: 1,
            expression: "self.transform.Position".to_string(),
            line: 0,
            column: 0,
            context: "repl".to_string(),
        });
        round_trip(Message::EvaluateResponse {
            request_id: 3,
            variable: var("result", 103, "Vector3", "(0, 1, 0)"),
        });
    }

    #[test]
    fn test_scopes_request_exact_bytes() {
        let encoded = Message::ScopesRequest {
            request_id: 16909060, // bytes [4, 3, 2, 1] on the wire
            stack_frame_id: 2,
        }
        .encode();
        assert_eq!(
            encoded,
            vec![10, 13, 0, 0, 0, 4, 3, 2, 1, 2, 0, 0, 0],
        );
    }

    #[test]
    fn test_heartbeat_is_header_only() {
        let encoded = Message::Heartbeat.encode();
        assert_eq!(encoded, vec![0, 5, 0, 0, 0]);
    }

    #[test]
    fn test_header_rejects_unknown_tag() {
        let err = Header::decode(&[0xFF, 5, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::UnknownTag(0xFF)));
    }

    #[test]
    fn test_header_rejects_undersized_length() {
        let err = Header::decode(&[0, 4, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::FrameTooShort(4)));
    }

    #[test]
    fn test_string_overrun_is_malformed() {
        // FailureResponse with a declared reason length of 100 but only 3
        // payload bytes behind it.
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&100u32.to_le_bytes());
        payload.extend_from_slice(b"abc");
        let err = Message::decode(MessageType::FailureResponse, &payload).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_truncated_u32_is_malformed() {
        let err = Message::decode(MessageType::ScopesRequest, &[1, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_trailing_bytes_are_tolerated() {
        let mut encoded = Message::ScopesRequest {
            request_id: 1,
            stack_frame_id: 2,
        }
        .encode();
        encoded.extend_from_slice(&[0xDE, 0xAD]);
        let decoded = Message::decode(MessageType::ScopesRequest, &encoded[HEADER_LEN..]).unwrap();
        assert_eq!(
            decoded,
            Message::ScopesRequest {
                request_id: 1,
                stack_frame_id: 2
            }
        );
    }
}
