//! Pluggable caveat suppliers (run at mint time) and verifiers (run at verify time).

use super::caveat::MacaroonCaveat;
use super::condition::{MacaroonCondition, Operator};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

pub const VERSION_KEY: &str = "dpc_macaroon_version";
pub const EXPIRATION_KEY: &str = "expires";

/// Outcome of running one verifier against one caveat condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaveatCheck {
    Satisfied,
    Unsatisfied(String),
    /// The verifier has no opinion about this caveat.
    NotApplicable,
}

/// A caveat passes when no verifier rejects it and at least one verifier satisfies it.
pub trait CaveatVerifier: Send + Sync {
    fn check(&self, condition: &MacaroonCondition) -> CaveatCheck;
}

impl<F> CaveatVerifier for F
where
    F: Fn(&MacaroonCondition) -> CaveatCheck + Send + Sync,
{
    fn check(&self, condition: &MacaroonCondition) -> CaveatCheck {
        self(condition)
    }
}

pub trait CaveatSupplier: Send + Sync {
    fn supply(&self) -> MacaroonCaveat;
}

impl<F> CaveatSupplier for F
where
    F: Fn() -> MacaroonCaveat + Send + Sync,
{
    fn supply(&self) -> MacaroonCaveat {
        self()
    }
}

/// Satisfies a caveat whose text matches exactly.
#[derive(Debug, Clone)]
pub struct ExactVerifier(pub String);

impl CaveatVerifier for ExactVerifier {
    fn check(&self, condition: &MacaroonCondition) -> CaveatCheck {
        if condition.to_string() == self.0 {
            CaveatCheck::Satisfied
        } else {
            CaveatCheck::NotApplicable
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VersionCaveatSupplier {
    version: u32,
}

impl VersionCaveatSupplier {
    pub fn new(version: u32) -> Self {
        Self { version }
    }
}

impl CaveatSupplier for VersionCaveatSupplier {
    fn supply(&self) -> MacaroonCaveat {
        MacaroonCaveat::first_party(MacaroonCondition::new(
            VERSION_KEY,
            Operator::Eq,
            self.version.to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VersionCaveatVerifier {
    version: u32,
}

impl VersionCaveatVerifier {
    pub fn new(version: u32) -> Self {
        Self { version }
    }
}

impl CaveatVerifier for VersionCaveatVerifier {
    fn check(&self, condition: &MacaroonCondition) -> CaveatCheck {
        if condition.key() != VERSION_KEY {
            return CaveatCheck::NotApplicable;
        }
        match condition.value().parse::<u32>() {
            Ok(version) if condition.op() == Operator::Eq && version == self.version => {
                CaveatCheck::Satisfied
            }
            _ => CaveatCheck::Unsatisfied(format!(
                "Unsupported macaroon version: {}",
                condition.value()
            )),
        }
    }
}

/// Adds an `expires = <RFC 3339 instant>` caveat, `lifetime` from mint time.
#[derive(Debug, Clone, Copy)]
pub struct ExpirationCaveatSupplier {
    lifetime: Duration,
}

impl ExpirationCaveatSupplier {
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime }
    }
}

impl CaveatSupplier for ExpirationCaveatSupplier {
    fn supply(&self) -> MacaroonCaveat {
        let expires = Utc::now() + self.lifetime;
        MacaroonCaveat::first_party(MacaroonCondition::new(
            EXPIRATION_KEY,
            Operator::Eq,
            expires.to_rfc3339_opts(SecondsFormat::Millis, true),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpirationCaveatVerifier;

impl ExpirationCaveatVerifier {
    fn check_at(&self, condition: &MacaroonCondition, now: DateTime<Utc>) -> CaveatCheck {
        if condition.key() != EXPIRATION_KEY {
            return CaveatCheck::NotApplicable;
        }
        if condition.op() != Operator::Eq {
            return CaveatCheck::Unsatisfied(format!(
                "Unsupported expiration operator: {}",
                condition.op()
            ));
        }
        match DateTime::parse_from_rfc3339(condition.value()) {
            Ok(expires) if now < expires.with_timezone(&Utc) => CaveatCheck::Satisfied,
            Ok(_) => CaveatCheck::Unsatisfied("Caveat is expired".to_string()),
            Err(_) => CaveatCheck::Unsatisfied(format!(
                "Cannot parse expiration: {}",
                condition.value()
            )),
        }
    }
}

impl CaveatVerifier for ExpirationCaveatVerifier {
    fn check(&self, condition: &MacaroonCondition) -> CaveatCheck {
        self.check_at(condition, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_verifier_ignores_other_keys() {
        let verifier = VersionCaveatVerifier::new(1);
        let other = MacaroonCondition::new("organization_id", Operator::Eq, "1");
        assert_eq!(verifier.check(&other), CaveatCheck::NotApplicable);
    }

    #[test]
    fn version_verifier_checks_value() {
        let verifier = VersionCaveatVerifier::new(1);
        let supplied = VersionCaveatSupplier::new(1).supply();
        assert_eq!(verifier.check(supplied.condition()), CaveatCheck::Satisfied);

        let wrong = VersionCaveatSupplier::new(2).supply();
        assert!(matches!(
            verifier.check(wrong.condition()),
            CaveatCheck::Unsatisfied(_)
        ));
    }

    #[test]
    fn expiration_verifier_accepts_future_and_rejects_past() {
        let verifier = ExpirationCaveatVerifier;
        let caveat = ExpirationCaveatSupplier::new(Duration::minutes(5)).supply();
        assert_eq!(verifier.check(caveat.condition()), CaveatCheck::Satisfied);

        let later = Utc::now() + Duration::minutes(10);
        assert_eq!(
            verifier.check_at(caveat.condition(), later),
            CaveatCheck::Unsatisfied("Caveat is expired".to_string())
        );
    }

    #[test]
    fn expiration_verifier_rejects_garbage() {
        let condition = MacaroonCondition::new(EXPIRATION_KEY, Operator::Eq, "tomorrow");
        assert!(matches!(
            ExpirationCaveatVerifier.check(&condition),
            CaveatCheck::Unsatisfied(_)
        ));
    }

    #[test]
    fn expiration_verifier_only_accepts_equality() {
        let future = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
        for op in [Operator::Lt, Operator::Neq, Operator::Geq] {
            let condition = MacaroonCondition::new(EXPIRATION_KEY, op, &future);
            assert_eq!(
                ExpirationCaveatVerifier.check(&condition),
                CaveatCheck::Unsatisfied(format!("Unsupported expiration operator: {}", op))
            );
        }
        let condition = MacaroonCondition::new(EXPIRATION_KEY, Operator::Eq, &future);
        assert_eq!(ExpirationCaveatVerifier.check(&condition), CaveatCheck::Satisfied);
    }

    #[test]
    fn exact_verifier_matches_full_text() {
        let verifier = ExactVerifier("org_id = 123".to_string());
        let condition: MacaroonCondition = "org_id = 123".parse().unwrap();
        assert_eq!(verifier.check(&condition), CaveatCheck::Satisfied);

        let other: MacaroonCondition = "org_id = 456".parse().unwrap();
        assert_eq!(verifier.check(&other), CaveatCheck::NotApplicable);
    }
}
