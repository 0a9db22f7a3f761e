//! shelfscan: resolves noisy vision-extracted collection items into canonical
//! catalog records, pulling metadata from external providers and merging on
//! write so no real-world item ever gets two rows.

pub mod config;
pub mod enrich;
pub mod env_boot;
pub mod fingerprint;
pub mod learner;
pub mod matcher;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod providers;
pub mod store;
pub mod tracing;

pub mod util {
    pub mod env;
    pub mod pool;
}
