pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory: {requested} bytes requested")]
    OutOfMemory { requested: usize },

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("alignment {alignment} exceeds allocation granularity {granularity}")]
    AlignmentTooLarge { alignment: usize, granularity: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("allocator not initialized")]
    NotInitialized,

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("allocator has been shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_handle<S: Into<String>>(msg: S) -> Self {
        Error::InvalidHandle(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Capacity exhaustion, as opposed to caller misuse.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }

    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, Error::InvalidHandle(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::OutOfMemory { requested: 4096 };
        assert_eq!(err.to_string(), "out of memory: 4096 bytes requested");

        let err = Error::AlignmentTooLarge {
            alignment: 1 << 20,
            granularity: 65536,
        };
        assert!(err.to_string().contains("65536"));
    }

    #[test]
    fn test_error_kinds() {
        assert!(Error::OutOfMemory { requested: 1 }.is_out_of_memory());
        assert!(Error::invalid_handle("bad marker").is_invalid_handle());
        assert!(!Error::invalid_argument("zero").is_invalid_handle());
    }
}
