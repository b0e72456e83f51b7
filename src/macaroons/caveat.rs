use super::condition::MacaroonCondition;
use std::fmt;

/// A caveat to attach to a macaroon.
///
/// An empty location makes this a first-party caveat, checked locally by the bakery's
/// verifiers. Any other location marks a third-party caveat, which this bakery rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacaroonCaveat {
    location: String,
    condition: MacaroonCondition,
    verification_id: Vec<u8>,
}

impl MacaroonCaveat {
    pub fn new(location: impl Into<String>, condition: MacaroonCondition) -> Self {
        Self {
            location: location.into(),
            condition,
            verification_id: Vec::new(),
        }
    }

    pub fn first_party(condition: MacaroonCondition) -> Self {
        Self::new("", condition)
    }

    pub(crate) fn with_verification_id(mut self, verification_id: Vec<u8>) -> Self {
        self.verification_id = verification_id;
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn condition(&self) -> &MacaroonCondition {
        &self.condition
    }

    pub fn verification_id(&self) -> &[u8] {
        &self.verification_id
    }

    pub fn is_third_party(&self) -> bool {
        !self.location.is_empty()
    }
}

impl fmt::Display for MacaroonCaveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.condition.fmt(f)
    }
}
