//! Error type for logger setup

/// Result alias for logger operations
pub type LogResult<T> = Result<T, LogError>;

/// Errors raised while installing the global subscriber
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The level directive could not be parsed by `EnvFilter`
    #[error("Invalid filter '{filter}': {reason}")]
    Filter {
        /// Directive as given
        filter: String,
        /// Parser message
        reason: String,
    },

    /// A global subscriber is already installed
    #[error("Logger initialization failed: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_error_names_the_directive() {
        let err = LogError::Filter {
            filter: "os::vm=loud".into(),
            reason: "invalid level".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid filter 'os::vm=loud': invalid level"
        );
    }
}
