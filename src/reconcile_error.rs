use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Classification of a failure inside a pass, by the phase that failed.
///
/// Declaration order is lexicographic so that `Ord` matches the string order of the codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReasonCode {
    /// Querying or authenticating against the cloud API
    CloudProviderAPIFailure,
    /// Turning a created server into a cluster node
    VMConfigurationFailure,
    /// Creating a server
    VMCreationFailure,
    /// Destroying a server
    VMTerminationFailure,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::CloudProviderAPIFailure => "CloudProviderAPIFailure",
            ReasonCode::VMConfigurationFailure => "VMConfigurationFailure",
            ReasonCode::VMCreationFailure => "VMCreationFailure",
            ReasonCode::VMTerminationFailure => "VMTerminationFailure",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("{reason}: {source}")]
pub struct ReconcileError {
    reason: ReasonCode,
    #[source]
    source: Box<dyn StdError + Send + Sync>,
}

impl ReconcileError {
    pub fn new(reason: ReasonCode, source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            reason,
            source: source.into(),
        }
    }

    pub fn cloud_api(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ReasonCode::CloudProviderAPIFailure, source)
    }

    pub fn creation(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ReasonCode::VMCreationFailure, source)
    }

    pub fn configuration(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ReasonCode::VMConfigurationFailure, source)
    }

    pub fn termination(source: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(ReasonCode::VMTerminationFailure, source)
    }

    pub fn reason(&self) -> ReasonCode {
        self.reason
    }

    /// The originating error's message, without the reason prefix.
    pub fn message(&self) -> String {
        self.source.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_order_is_lexicographic() {
        let mut codes = vec![
            ReasonCode::VMTerminationFailure,
            ReasonCode::VMCreationFailure,
            ReasonCode::CloudProviderAPIFailure,
            ReasonCode::VMConfigurationFailure,
        ];
        codes.sort();
        let mut names: Vec<_> = codes.iter().map(|c| c.as_str()).collect();
        let sorted = names.clone();
        names.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn message_excludes_reason() {
        let e = ReconcileError::creation("quota exceeded");
        assert_eq!(e.reason(), ReasonCode::VMCreationFailure);
        assert_eq!(e.message(), "quota exceeded");
        assert_eq!(e.to_string(), "VMCreationFailure: quota exceeded");
    }
}
