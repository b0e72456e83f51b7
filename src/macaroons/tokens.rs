//! Caveat sets for organization-scoped access tokens.

use super::bakery::MacaroonBakery;
use super::caveat::MacaroonCaveat;
use super::condition::{MacaroonCondition, Operator};
use super::error::{BakeryError, Result};
use super::macaroon::Macaroon;
use super::verifiers::{ExpirationCaveatSupplier, VersionCaveatSupplier};
use super::CaveatSupplier;
use chrono::Duration;
use uuid::Uuid;

pub const ORGANIZATION_CAVEAT_KEY: &str = "organization_id";
pub const CURRENT_TOKEN_VERSION: u32 = 1;

pub fn organization_caveat(org_id: Uuid) -> MacaroonCaveat {
    MacaroonCaveat::first_party(MacaroonCondition::new(
        ORGANIZATION_CAVEAT_KEY,
        Operator::Eq,
        org_id.to_string(),
    ))
}

/// Caveats carried by a freshly issued token: version, expiration and organization.
pub fn generate_caveats_for_token(
    version: u32,
    org_id: Uuid,
    lifetime: Duration,
) -> Result<Vec<MacaroonCaveat>> {
    if version != CURRENT_TOKEN_VERSION {
        return Err(BakeryError::InvalidCondition(format!(
            "Unsupported token version: {}",
            version
        )));
    }
    Ok(vec![
        VersionCaveatSupplier::new(version).supply(),
        ExpirationCaveatSupplier::new(lifetime).supply(),
        organization_caveat(org_id),
    ])
}

/// Finds the organization a token is scoped to. Tokens carrying zero or several
/// organization caveats are rejected.
pub fn extract_org_id(macaroon: &Macaroon) -> Result<Uuid> {
    let mut org_ids = MacaroonBakery::get_caveats(macaroon)?
        .into_iter()
        .filter(|c| c.condition().key() == ORGANIZATION_CAVEAT_KEY);

    let caveat = org_ids
        .next()
        .ok_or_else(|| BakeryError::Unsatisfied("Token is not scoped to an organization".into()))?;
    if org_ids.next().is_some() {
        return Err(BakeryError::Unsatisfied(
            "Token is scoped to more than one organization".into(),
        ));
    }

    Uuid::parse_str(caveat.condition().value())
        .map_err(|_| BakeryError::InvalidCondition(caveat.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macaroons::store::MemoryRootKeyStore;
    use crate::macaroons::verifiers::{ExpirationCaveatVerifier, VersionCaveatVerifier};
    use std::sync::Arc;

    fn bakery() -> MacaroonBakery {
        MacaroonBakery::builder("http://localhost:3002", Arc::new(MemoryRootKeyStore::new()))
            .add_default_verifier(VersionCaveatVerifier::new(CURRENT_TOKEN_VERSION))
            .add_default_verifier(ExpirationCaveatVerifier)
            .build()
    }

    #[tokio::test]
    async fn issued_token_verifies_for_its_organization() {
        let bakery = bakery();
        let org_id = Uuid::new_v4();
        let caveats = generate_caveats_for_token(1, org_id, Duration::minutes(5)).unwrap();
        let token = bakery.create_macaroon(&caveats).await.unwrap();

        assert_eq!(extract_org_id(&token).unwrap(), org_id);

        let expected = organization_caveat(org_id).to_string();
        bakery.verify_macaroon_exact(&token, &[expected.as_str()]).await.unwrap();

        let other = organization_caveat(Uuid::new_v4()).to_string();
        assert!(bakery.verify_macaroon_exact(&token, &[other.as_str()]).await.is_err());
    }

    #[tokio::test]
    async fn attenuating_with_second_org_is_rejected() {
        let bakery = bakery();
        let caveats = generate_caveats_for_token(1, Uuid::new_v4(), Duration::minutes(5)).unwrap();
        let token = bakery.create_macaroon(&caveats).await.unwrap();
        let widened = bakery
            .add_caveats(&token, &[organization_caveat(Uuid::new_v4())])
            .unwrap();

        assert!(matches!(
            extract_org_id(&widened),
            Err(BakeryError::Unsatisfied(_))
        ));
    }

    #[test]
    fn only_version_one_tokens_can_be_generated() {
        assert!(generate_caveats_for_token(2, Uuid::new_v4(), Duration::minutes(5)).is_err());
    }
}
