// =============================================================================
// Engine-internal error taxonomy
// =============================================================================
//
// Propagation policy:
//   - Inside the trader's per-tick loop every error is caught; transient ones
//     emit an event and the loop continues, fatal ones flip the strategy to
//     Error and exit the loop.
//   - Outside the loop (create/start/stop/delete) errors are returned to the
//     caller and emitted as events.
// =============================================================================

use thiserror::Error;

use crate::exchange::ExchangeError;

/// Errors surfaced by the strategy engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid user input: missing levels, non-positive amounts, order size
    /// below the exchange minimum. The strategy stays in its current state.
    #[error("config error: {0}")]
    Config(String),

    /// Propagated connector failure. Transient kinds are retried within the
    /// operation's retry budget; permanent kinds stop the strategy.
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// Impossible internal transition (fill applied to a filled level, reset
    /// while an order is pending). Programmer error: log loudly, stop.
    #[error("state error: {0}")]
    State(String),

    /// I/O or schema failure in the durable store. Saves are retried on the
    /// next auto-save tick; an invalid file is refused, never partially loaded.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// No strategy registered under the given uid.
    #[error("strategy not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Whether the strategy can keep running after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Persistence(_) | Self::NotFound(_) => false,
            Self::State(_) => true,
            Self::Exchange(e) => !e.is_transient(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
