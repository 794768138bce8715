//! Driver error taxonomy.
//!
//! Every failure coming back from the Nimbus API is translated into a
//! [`DriverError`] variant at the client boundary; higher layers forward
//! `NotFound` and provider errors unchanged and never reclassify them.

use thiserror::Error;

/// Provider status code for "entry does not exist".
pub const CODE_KEY_NOT_FOUND: u16 = 612;

/// Provider status code for "retry the request verbatim".
pub const CODE_RETRY: u16 = 599;

/// Terminal state of a write session, named in [`DriverError::SessionFinalized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Committed,
    Cancelled,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Closed => f.write_str("closed"),
            SessionState::Committed => f.write_str("committed"),
            SessionState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Errors surfaced by the driver.
///
/// The enum is `Clone` so a write session can capture a background upload
/// failure once and re-surface it on every subsequent call.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// The requested path or key does not exist.
    #[error("path not found: {path}")]
    NotFound { path: String },

    /// The provider asked for the request to be retried verbatim.
    /// Recovered by the paginated lister; only surfaced after retry
    /// exhaustion.
    #[error("transient provider failure (code {code}): {message}")]
    Transient { code: u16, message: String },

    /// A write session was used after a terminal transition.
    #[error("write session already {state}")]
    SessionFinalized { state: SessionState },

    /// Any other provider-side error, with the detail extracted from the
    /// response body.
    #[error("provider error (code {code}): {message}")]
    Provider { code: u16, message: String },

    /// Connection-level or stream IO failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid construction parameters.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DriverError {
    /// Translate a provider status code into the taxonomy.
    ///
    /// `key` names the object the failed call was about and becomes the
    /// `NotFound` path; callers with an external path remap it.
    pub fn from_provider(key: &str, code: u16, message: String) -> DriverError {
        match code {
            CODE_KEY_NOT_FOUND => DriverError::NotFound { path: key.to_string() },
            CODE_RETRY => DriverError::Transient { code, message },
            _ => DriverError::Provider { code, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient { .. })
    }

    /// Rewrite the path carried by a `NotFound`, leaving other variants
    /// untouched. Used by the facade to report external paths instead of
    /// backend keys.
    pub fn with_path(self, path: &str) -> DriverError {
        match self {
            DriverError::NotFound { .. } => DriverError::NotFound { path: path.to_string() },
            other => other,
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        DriverError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Transport(err.to_string())
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_code_maps_to_not_found() {
        let err = DriverError::from_provider("a/b", CODE_KEY_NOT_FOUND, "no such entry".into());
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "path not found: a/b");
    }

    #[test]
    fn retry_code_maps_to_transient() {
        let err = DriverError::from_provider("a/b", CODE_RETRY, "try again".into());
        assert!(err.is_transient());
    }

    #[test]
    fn other_codes_pass_through_with_detail() {
        let err = DriverError::from_provider("a/b", 500, "backend exploded".into());
        assert!(!err.is_not_found());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("backend exploded"));
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn with_path_rewrites_only_not_found() {
        let nf = DriverError::NotFound { path: "key/under/root".into() }.with_path("/external");
        assert_eq!(nf.to_string(), "path not found: /external");

        let other = DriverError::Transport("boom".into()).with_path("/external");
        assert!(matches!(other, DriverError::Transport(_)));
    }

    #[test]
    fn session_states_render_in_message() {
        for (state, want) in [
            (SessionState::Closed, "already closed"),
            (SessionState::Committed, "already committed"),
            (SessionState::Cancelled, "already cancelled"),
        ] {
            let err = DriverError::SessionFinalized { state };
            assert!(err.to_string().contains(want), "{err}");
        }
    }
}
