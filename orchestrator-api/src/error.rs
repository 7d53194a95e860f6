/// Messages orchestrator replies with when it does not know the cluster or host
const NOT_FOUND_MESSAGES: [&str; 3] = [
    "Unable to determine cluster name",
    "Cannot read instance",
    "No masters found",
];

/// Orchestrator client errors
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The request did not reach orchestrator
    #[error("orchestrator request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Orchestrator replied with a server error
    #[error("[orc]: status: {status} msg: {message}")]
    Status {
        /// Http status
        status: u16,
        /// Message of the reply, if any
        message: String,
    },
    /// Orchestrator replied with a non `OK` code
    #[error("orc failed with: {message}")]
    Api {
        /// The reply code
        code: String,
        /// The reply message
        message: String,
    },
    /// The reply is not valid json
    #[error("cannot decode orchestrator reply: {0}")]
    Decode(#[from] serde_json::Error),
    /// No master in the topology
    #[error("no master found in the topology")]
    NoMaster,
    /// More than one writable root in the topology
    #[error("multiple masters found in the topology: {0:?}")]
    MultipleMasters(Vec<String>),
}

impl Error {
    /// Whether orchestrator does not know the requested cluster or host
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        let message = match *self {
            Self::Status { ref message, .. } | Self::Api { ref message, .. } => message,
            Self::Request(_) | Self::Decode(_) | Self::NoMaster | Self::MultipleMasters(_) => {
                return false
            }
        };
        NOT_FOUND_MESSAGES.iter().any(|m| message.contains(m))
    }
}

/// Orchestrator client result
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn not_found_is_detected_by_message() {
        let err = Error::Status {
            status: 500,
            message: "Unable to determine cluster name. clusterHint=foo.default".to_owned(),
        };
        assert!(err.is_not_found());
        let err = Error::Api {
            code: "ERROR".to_owned(),
            message: "Cannot read instance: foo-mysql-0".to_owned(),
        };
        assert!(err.is_not_found());
        let err = Error::Status {
            status: 500,
            message: "database is locked".to_owned(),
        };
        assert!(!err.is_not_found());
        assert!(!Error::NoMaster.is_not_found());
    }
}
