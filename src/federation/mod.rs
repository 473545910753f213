//! Federated discovery of capability providers.
//!
//! Queries several registries concurrently, deduplicates what they report by
//! canonical id, scores each provider for trust and ranks the results.

pub mod errors;
pub mod federator;
pub mod merge;
pub mod sources;
pub mod trust;
pub mod types;

pub use errors::DiscoveryError;
pub use federator::RegistryFederator;
pub use merge::canonical_id;
pub use sources::{DiscoverySource, HttpRegistrySource, StaticSource};
pub use trust::{TrustBreakdown, TrustLevel};
pub use types::{
    DegradedSource, ProvenanceTag, RegistryEntry, SearchOutcome, ServerDescriptor,
    SourceObservation, SourceStatus,
};
