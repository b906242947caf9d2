use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] syrinx_protocol::ProtocolError),
}

impl ServerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }
}

/// Helper trait for adding context to IO errors.
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ServerError::io(f(), e))
    }
}
