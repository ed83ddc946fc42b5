use std::io;
use std::string::FromUtf8Error;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error("connect to {0}: {1}")]
    Connect(String, #[source] io::Error),
    #[error(transparent)]
    IO(#[from] io::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("no frame received for {0:?}, peer assumed dead")]
    IdleTimeout(Duration),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("frame length {0} is below the header size")]
    FrameTooShort(u32),
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    // --------------------------------- application errors ----------------------------------------
    #[error("request rejected by debuggee host: {0}")]
    Request(String),

    // --------------------------------- caller errors ---------------------------------------------
    #[error("a debug session already exists")]
    AlreadyConnected,
}

impl Error {
    /// Return a hint to an owner - is the current session still usable after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Request(_) => false,
            Error::AlreadyConnected => false,

            Error::Connect(_, _) => true,
            Error::IO(_) => true,
            Error::ConnectionClosed => true,
            Error::IdleTimeout(_) => true,
            Error::UnknownTag(_) => true,
            Error::FrameTooShort(_) => true,
            Error::MalformedFrame(_) => true,
            Error::FromUtf8(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
