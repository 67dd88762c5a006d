use thiserror::Error;

/// Errors that can abort the router service itself. Request-path failures
/// never surface here; they resolve to responses inside the proxy engine.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
