use std::fmt;

pub type Result<T, E = NetError> = error_stack::Result<T, E>;

/// Error taxonomy for the peer & membership layer (spec §7).
#[derive(Debug)]
pub enum NetError {
    /// Unsupported URL scheme, or a bind failure after exhausting the port probe range.
    Configuration(Box<str>),
    /// Connection reset, hello timeout, peer unreachable.
    Transport(Box<str>),
}

impl NetError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into().into_boxed_str())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into().into_boxed_str())
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for NetError {}
