//! Macaroon bearer tokens with first-party caveats.

pub mod bakery;
pub mod caveat;
pub mod condition;
pub mod error;
pub mod macaroon;
pub mod store;
pub mod tokens;
pub mod verifiers;

pub use bakery::{MacaroonBakery, MacaroonBakeryBuilder, MacaroonEncoding};
pub use caveat::MacaroonCaveat;
pub use condition::{MacaroonCondition, Operator};
pub use error::BakeryError;
pub use macaroon::{CaveatPacket, Macaroon};
pub use store::{MemoryRootKeyStore, PgRootKeyStore, RootKey, RootKeyStore};
pub use verifiers::{
    CaveatCheck, CaveatSupplier, CaveatVerifier, ExactVerifier, ExpirationCaveatSupplier,
    ExpirationCaveatVerifier, VersionCaveatSupplier, VersionCaveatVerifier,
};
