//! Raw backend error to [`ErrorKind`].

use crate::error::ErrorKind;
use crate::remote::RemoteError;

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &RemoteError) -> ErrorKind;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&RemoteError) -> ErrorKind + Send + Sync,
{
    fn classify(&self, error: &RemoteError) -> ErrorKind {
        self(error)
    }
}

/// Classifies by lowercase substring match against the error code and
/// message. Precondition patterns win over validation, validation over
/// transient; anything unmatched is permanent.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    precondition: Vec<String>,
    validation: Vec<String>,
    transient: Vec<String>,
}

impl PatternClassifier {
    pub fn empty() -> Self {
        Self {
            precondition: Vec::new(),
            validation: Vec::new(),
            transient: Vec::new(),
        }
    }

    pub fn with_transient(mut self, pattern: &str) -> Self {
        self.transient.push(pattern.to_lowercase());
        self
    }

    pub fn with_precondition(mut self, pattern: &str) -> Self {
        self.precondition.push(pattern.to_lowercase());
        self
    }

    pub fn with_validation(mut self, pattern: &str) -> Self {
        self.validation.push(pattern.to_lowercase());
        self
    }
}

impl Default for PatternClassifier {
    fn default() -> Self {
        let mut classifier = Self::empty()
            .with_precondition("unauthenticated")
            .with_precondition("permission-denied")
            .with_validation("invalid-argument");

        for pattern in [
            "unavailable",
            "deadline-exceeded",
            "timeout",
            "timed out",
            "network",
            "stream",
            "connection",
            "offline",
            "failed to get document because the client is offline",
        ] {
            classifier = classifier.with_transient(pattern);
        }
        classifier
    }
}

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, error: &RemoteError) -> ErrorKind {
        let code = error.code.to_lowercase();
        let message = error.message.to_lowercase();
        let hit = |patterns: &[String]| {
            patterns
                .iter()
                .any(|p| code.contains(p.as_str()) || message.contains(p.as_str()))
        };

        if hit(&self.precondition) {
            ErrorKind::Precondition
        } else if hit(&self.validation) {
            ErrorKind::Validation
        } else if hit(&self.transient) {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}
