//! Domain model shared by the provisioner, verifiers, lifecycle manager,
//! cost tracker and benchmark orchestrator.

mod benchmark;
mod cost;
mod offer;
mod session;

pub use benchmark::{BenchmarkRun, BenchmarkRunStatus, ManifestEntry, ManifestEntryStatus};
pub use cost::CostRecord;
pub use offer::{Offer, OfferFilter};
pub use session::{DestroyReason, Session, SessionStatus, StoragePolicy, WorkloadType};

#[cfg(test)]
pub use session::test_util;
