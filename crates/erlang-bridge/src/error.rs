use thiserror::Error;

/// Erlang bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer went away or the connection was closed locally
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Cookie challenge or node name exchange failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Connection refused by the inbound access rules
    #[error("Access denied for {0}")]
    AccessDenied(String),

    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// A bounded wait elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The call engine refused an operation
    #[error("Engine error: {0}")]
    Engine(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create a new ConnectionClosed error
    pub fn closed<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    /// Create a new Handshake error
    pub fn handshake<S: Into<String>>(msg: S) -> Self {
        Self::Handshake(msg.into())
    }

    /// Create a new Codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a new Timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new InvalidArgument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a new Engine error
    pub fn engine<S: Into<String>>(msg: S) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a new Internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error ends the connection it happened on
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed(_) | Self::Handshake(_) | Self::Timeout(_)
        )
    }
}

impl From<bincode::Error> for BridgeError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
