use super::caveat::MacaroonCaveat;
use super::condition::MacaroonCondition;
use super::error::{BakeryError, Result};
use super::macaroon::{Macaroon, V2JsonMacaroon, URL_SAFE_LENIENT};
use super::store::RootKeyStore;
use super::verifiers::{CaveatCheck, CaveatSupplier, CaveatVerifier, ExactVerifier};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Wire encoding of a serialized macaroon list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacaroonEncoding {
    Json,
    Base64Json,
}

impl MacaroonEncoding {
    /// `[` and `{` are not in the URL-safe base64 alphabet, so the first non-blank character
    /// decides the encoding.
    pub fn detect(serialized: &str) -> Result<Self> {
        match serialized.trim_start().chars().next() {
            None => Err(BakeryError::Malformed("Cannot deserialize empty string".into())),
            Some('[') | Some('{') => Ok(MacaroonEncoding::Json),
            Some(_) => Ok(MacaroonEncoding::Base64Json),
        }
    }
}

/// Factory for minting, attenuating and verifying macaroons.
///
/// Only first-party caveats are supported. Default verifiers are run on every verification
/// and default suppliers contribute caveats to every freshly minted macaroon.
pub struct MacaroonBakery {
    location: String,
    store: Arc<dyn RootKeyStore>,
    default_verifiers: Vec<Arc<dyn CaveatVerifier>>,
    default_suppliers: Vec<Arc<dyn CaveatSupplier>>,
}

impl MacaroonBakery {
    pub fn builder(location: impl Into<String>, store: Arc<dyn RootKeyStore>) -> MacaroonBakeryBuilder {
        MacaroonBakeryBuilder::new(location, store)
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    #[instrument(skip_all, fields(caveats = caveats.len()))]
    pub async fn create_macaroon(&self, caveats: &[MacaroonCaveat]) -> Result<Macaroon> {
        let mut all_caveats: Vec<MacaroonCaveat> =
            self.default_suppliers.iter().map(|s| s.supply()).collect();
        all_caveats.extend_from_slice(caveats);
        reject_third_party(&all_caveats)?;

        let root_key = self.store.create().await?;
        let macaroon = Macaroon::new(self.location.clone(), &root_key.key, root_key.id);
        debug!(identifier = macaroon.identifier(), "Minted macaroon");

        Ok(append_caveats(macaroon, &all_caveats))
    }

    /// Returns a new macaroon with `caveats` appended; `macaroon` is not modified.
    pub fn add_caveats(&self, macaroon: &Macaroon, caveats: &[MacaroonCaveat]) -> Result<Macaroon> {
        reject_third_party(caveats)?;
        Ok(append_caveats(macaroon.clone(), caveats))
    }

    /// Parses the caveats of `macaroon` back into [`MacaroonCaveat`] values, in order.
    pub fn get_caveats(macaroon: &Macaroon) -> Result<Vec<MacaroonCaveat>> {
        macaroon
            .caveat_packets()
            .iter()
            .map(|packet| {
                let text = std::str::from_utf8(&packet.id).map_err(|_| {
                    BakeryError::InvalidCondition("Caveat is not valid UTF-8".to_string())
                })?;
                let caveat = MacaroonCaveat::new(
                    packet.location.clone().unwrap_or_default(),
                    text.parse::<MacaroonCondition>()?,
                );
                Ok(match &packet.verification_id {
                    Some(vid) => caveat.with_verification_id(vid.clone()),
                    None => caveat,
                })
            })
            .collect()
    }

    pub async fn verify_macaroon(
        &self,
        macaroon: &Macaroon,
        verifiers: &[&dyn CaveatVerifier],
    ) -> Result<()> {
        let mut all: Vec<&dyn CaveatVerifier> = self
            .default_verifiers
            .iter()
            .map(|v| v.as_ref())
            .collect();
        all.extend_from_slice(verifiers);

        let root_key = self.store.get(macaroon.identifier()).await?;
        macaroon.verify_signature(&root_key)?;

        for caveat in Self::get_caveats(macaroon)? {
            check_caveat(caveat.condition(), &all)?;
        }
        Ok(())
    }

    /// Verifies using the default verifiers plus caveats that must match `exact` verbatim.
    pub async fn verify_macaroon_exact(&self, macaroon: &Macaroon, exact: &[&str]) -> Result<()> {
        let exact: Vec<ExactVerifier> = exact.iter().map(|e| ExactVerifier(e.to_string())).collect();
        let verifiers: Vec<&dyn CaveatVerifier> =
            exact.iter().map(|v| v as &dyn CaveatVerifier).collect();
        self.verify_macaroon(macaroon, &verifiers).await
    }

    pub fn serialize_macaroon(&self, macaroon: &Macaroon, base64: bool) -> Vec<u8> {
        self.serialize_macaroons(std::slice::from_ref(macaroon), base64)
    }

    /// Serializes as a V2 JSON array, optionally URL-safe base64 encoded.
    pub fn serialize_macaroons(&self, macaroons: &[Macaroon], base64: bool) -> Vec<u8> {
        let json: Vec<V2JsonMacaroon> = macaroons.iter().map(Macaroon::to_json).collect();
        let bytes = serde_json::to_vec(&json).expect("macaroon JSON serialization cannot fail");
        if base64 {
            URL_SAFE.encode(bytes).into_bytes()
        } else {
            bytes
        }
    }

    /// Deserializes a single macaroon, detecting the encoding.
    pub fn deserialize_macaroon(serialized: &str) -> Result<Macaroon> {
        let mut macaroons = Self::deserialize_macaroons(serialized)?;
        match macaroons.len() {
            1 => Ok(macaroons.remove(0)),
            0 => Err(BakeryError::Malformed("No macaroons present".into())),
            n => Err(BakeryError::Malformed(format!(
                "Expected a single macaroon, found {} (discharge macaroons are not supported)",
                n
            ))),
        }
    }

    pub fn deserialize_macaroons(serialized: &str) -> Result<Vec<Macaroon>> {
        let encoding = MacaroonEncoding::detect(serialized)?;
        Self::deserialize_macaroons_with(serialized, encoding)
    }

    pub fn deserialize_macaroons_with(
        serialized: &str,
        encoding: MacaroonEncoding,
    ) -> Result<Vec<Macaroon>> {
        let decoded = match encoding {
            MacaroonEncoding::Json => serialized.trim().as_bytes().to_vec(),
            MacaroonEncoding::Base64Json => URL_SAFE_LENIENT
                .decode(serialized.trim())
                .map_err(|e| BakeryError::Malformed(e.to_string()))?,
        };

        let value: serde_json::Value =
            serde_json::from_slice(&decoded).map_err(|e| BakeryError::Malformed(e.to_string()))?;
        let json: Vec<V2JsonMacaroon> = if value.is_array() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value(value).map(|m| vec![m])
        }
        .map_err(|e| BakeryError::Malformed(e.to_string()))?;

        json.into_iter().map(Macaroon::from_json).collect()
    }
}

fn reject_third_party(caveats: &[MacaroonCaveat]) -> Result<()> {
    match caveats.iter().find(|c| c.is_third_party()) {
        Some(caveat) => Err(BakeryError::UnsupportedThirdParty(caveat.location().to_string())),
        None => Ok(()),
    }
}

fn append_caveats(macaroon: Macaroon, caveats: &[MacaroonCaveat]) -> Macaroon {
    caveats.iter().fold(macaroon, |m, caveat| {
        m.with_first_party_caveat(&caveat.condition().to_string())
    })
}

fn check_caveat(condition: &MacaroonCondition, verifiers: &[&dyn CaveatVerifier]) -> Result<()> {
    let mut satisfied = false;
    for verifier in verifiers {
        match verifier.check(condition) {
            CaveatCheck::Satisfied => satisfied = true,
            CaveatCheck::Unsatisfied(reason) => {
                return Err(BakeryError::Unsatisfied(format!("{} ({})", condition, reason)))
            }
            CaveatCheck::NotApplicable => {}
        }
    }
    if satisfied {
        Ok(())
    } else {
        Err(BakeryError::Unsatisfied(condition.to_string()))
    }
}

pub struct MacaroonBakeryBuilder {
    location: String,
    store: Arc<dyn RootKeyStore>,
    verifiers: Vec<Arc<dyn CaveatVerifier>>,
    suppliers: Vec<Arc<dyn CaveatSupplier>>,
}

impl MacaroonBakeryBuilder {
    pub fn new(location: impl Into<String>, store: Arc<dyn RootKeyStore>) -> Self {
        Self {
            location: location.into(),
            store,
            verifiers: Vec::new(),
            suppliers: Vec::new(),
        }
    }

    pub fn add_default_verifier(mut self, verifier: impl CaveatVerifier + 'static) -> Self {
        self.verifiers.push(Arc::new(verifier));
        self
    }

    /// Suppliers only apply to newly minted macaroons, not to [`MacaroonBakery::add_caveats`].
    pub fn add_default_caveat_supplier(mut self, supplier: impl CaveatSupplier + 'static) -> Self {
        self.suppliers.push(Arc::new(supplier));
        self
    }

    pub fn build(self) -> MacaroonBakery {
        MacaroonBakery {
            location: self.location,
            store: self.store,
            default_verifiers: self.verifiers,
            default_suppliers: self.suppliers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macaroons::condition::tests::any_condition;
    use crate::macaroons::condition::Operator;
    use crate::macaroons::store::MemoryRootKeyStore;
    use crate::macaroons::verifiers::{
        ExpirationCaveatSupplier, ExpirationCaveatVerifier, VersionCaveatSupplier,
        VersionCaveatVerifier,
    };
    use proptest::prelude::*;

    fn bakery() -> MacaroonBakery {
        MacaroonBakery::builder("http://localhost", Arc::new(MemoryRootKeyStore::new())).build()
    }

    fn caveat(raw: &str) -> MacaroonCaveat {
        MacaroonCaveat::first_party(raw.parse().unwrap())
    }

    #[tokio::test]
    async fn caveats_are_returned_in_insertion_order() {
        let bakery = bakery();
        let caveats = vec![caveat("test_id = 1234"), caveat("b >= 2"), caveat("a != 3")];
        let macaroon = bakery.create_macaroon(&caveats).await.unwrap();

        assert_eq!(MacaroonBakery::get_caveats(&macaroon).unwrap(), caveats);
        assert_eq!(macaroon.location(), "http://localhost");
    }

    #[tokio::test]
    async fn rejects_third_party_caveats() {
        let bakery = bakery();
        let third_party = MacaroonCaveat::new(
            "http://localhost",
            MacaroonCondition::new("user", Operator::Eq, "Alice"),
        );
        let result = bakery.create_macaroon(&[caveat("a = 1"), third_party]).await;
        assert!(matches!(result, Err(BakeryError::UnsupportedThirdParty(loc)) if loc == "http://localhost"));
    }

    #[tokio::test]
    async fn serialization_round_trips() {
        let bakery = bakery();
        let macaroon = bakery.create_macaroon(&[caveat("test_id = 1234")]).await.unwrap();

        for base64 in [false, true] {
            let bytes = bakery.serialize_macaroon(&macaroon, base64);
            let text = String::from_utf8(bytes).unwrap();
            assert_eq!(MacaroonBakery::deserialize_macaroon(&text).unwrap(), macaroon);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        #[test]
        fn any_macaroon_survives_serialization(
            location in "[ -~]{0,30}",
            identifier in "\\PC{0,30}",
            root_key in prop::collection::vec(any::<u8>(), 1..64),
            conditions in prop::collection::vec(any_condition(), 0..6),
            base64 in any::<bool>(),
        ) {
            let macaroon = conditions
                .iter()
                .fold(Macaroon::new(location, &root_key, identifier), |m, condition| {
                    m.with_first_party_caveat(&condition.to_string())
                });

            let bakery = bakery();
            let text = String::from_utf8(bakery.serialize_macaroon(&macaroon, base64)).unwrap();
            let restored = MacaroonBakery::deserialize_macaroon(&text).unwrap();
            prop_assert_eq!(&restored, &macaroon);
            restored.verify_signature(&root_key).unwrap();

            let caveats: Vec<MacaroonCaveat> =
                conditions.into_iter().map(MacaroonCaveat::first_party).collect();
            prop_assert_eq!(MacaroonBakery::get_caveats(&restored).unwrap(), caveats);
        }
    }

    #[tokio::test]
    async fn base64_form_starts_like_legacy_tokens() {
        let bakery = bakery();
        let macaroon = bakery.create_macaroon(&[]).await.unwrap();
        let encoded = String::from_utf8(bakery.serialize_macaroon(&macaroon, true)).unwrap();
        // `[{` encodes to `W3`, which is what previously issued tokens look like.
        assert!(encoded.starts_with("W3"));
    }

    #[test]
    fn deserialize_rejects_garbage() {
        for input in ["", "   ", "not a macaroon", "[{\"v\":2}]", "{\"v\":1,\"i\":\"x\",\"s64\":\"AA\"}"] {
            assert!(
                matches!(MacaroonBakery::deserialize_macaroon(input), Err(BakeryError::Malformed(_))),
                "{input:?} should be malformed"
            );
        }
    }

    #[tokio::test]
    async fn verifies_exact_caveats() {
        let bakery = bakery();
        let macaroon = bakery.create_macaroon(&[caveat("org_id = 123")]).await.unwrap();

        bakery.verify_macaroon_exact(&macaroon, &["org_id = 123"]).await.unwrap();
        assert!(matches!(
            bakery.verify_macaroon_exact(&macaroon, &["org_id = 456"]).await,
            Err(BakeryError::Unsatisfied(_))
        ));
        assert!(matches!(
            bakery.verify_macaroon(&macaroon, &[]).await,
            Err(BakeryError::Unsatisfied(_))
        ));
    }

    #[tokio::test]
    async fn default_verifiers_apply_to_every_verification() {
        let verifier = |condition: &MacaroonCondition| {
            if condition.to_string() == "test_id = 1234" {
                CaveatCheck::Satisfied
            } else {
                CaveatCheck::NotApplicable
            }
        };
        let bakery = MacaroonBakery::builder("http://test.local", Arc::new(MemoryRootKeyStore::new()))
            .add_default_verifier(verifier)
            .build();

        let macaroon = bakery.create_macaroon(&[caveat("test_id = 1234")]).await.unwrap();
        bakery.verify_macaroon(&macaroon, &[]).await.unwrap();

        let attenuated = bakery.add_caveats(&macaroon, &[caveat("expires < now")]).unwrap();
        assert!(bakery.verify_macaroon(&attenuated, &[]).await.is_err());
        bakery.verify_macaroon_exact(&attenuated, &["expires < now"]).await.unwrap();
        assert!(bakery.verify_macaroon_exact(&attenuated, &["expires < wrong"]).await.is_err());

        // The original is still valid on its own.
        bakery.verify_macaroon(&macaroon, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn default_suppliers_prepend_caveats() {
        let bakery = MacaroonBakery::builder("http://test.local", Arc::new(MemoryRootKeyStore::new()))
            .add_default_caveat_supplier(VersionCaveatSupplier::new(1))
            .add_default_caveat_supplier(ExpirationCaveatSupplier::new(chrono::Duration::minutes(5)))
            .add_default_verifier(VersionCaveatVerifier::new(1))
            .add_default_verifier(ExpirationCaveatVerifier)
            .build();

        let macaroon = bakery.create_macaroon(&[caveat("test_id = 1234")]).await.unwrap();
        let caveats = MacaroonBakery::get_caveats(&macaroon).unwrap();
        assert_eq!(caveats.len(), 3);
        assert_eq!(caveats[0].to_string(), "dpc_macaroon_version = 1");
        assert_eq!(caveats[1].condition().key(), "expires");

        bakery.verify_macaroon_exact(&macaroon, &["test_id = 1234"]).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_wrong_version() {
        let minting = MacaroonBakery::builder("http://test.local", Arc::new(MemoryRootKeyStore::new()))
            .add_default_caveat_supplier(VersionCaveatSupplier::new(2))
            .build();
        let macaroon = minting.create_macaroon(&[]).await.unwrap();

        let verifying = MacaroonBakery {
            location: minting.location.clone(),
            store: minting.store.clone(),
            default_verifiers: vec![Arc::new(VersionCaveatVerifier::new(1))],
            default_suppliers: Vec::new(),
        };
        assert!(matches!(
            verifying.verify_macaroon(&macaroon, &[]).await,
            Err(BakeryError::Unsatisfied(_))
        ));
    }

    #[tokio::test]
    async fn unknown_identifier_fails_lookup() {
        let macaroon = bakery().create_macaroon(&[caveat("a = 1")]).await.unwrap();
        // A different bakery has a different store.
        let other = bakery();
        assert!(matches!(
            other.verify_macaroon_exact(&macaroon, &["a = 1"]).await,
            Err(BakeryError::UnknownRootKey(_))
        ));
    }

    #[tokio::test]
    async fn tampered_caveat_fails_signature() {
        let bakery = bakery();
        let macaroon = bakery.create_macaroon(&[caveat("org_id = 123")]).await.unwrap();
        let json = String::from_utf8(bakery.serialize_macaroon(&macaroon, false)).unwrap();
        let tampered =
            MacaroonBakery::deserialize_macaroon(&json.replace("org_id = 123", "org_id = 456"))
                .unwrap();

        assert!(matches!(
            bakery.verify_macaroon_exact(&tampered, &["org_id = 456"]).await,
            Err(BakeryError::InvalidSignature)
        ));
    }
}
