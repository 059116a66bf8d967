//! Persistence for the reconciler: the unit-of-work store contract with
//! in-memory and PostgreSQL backends, raw payload archiving, and the HTTP
//! client the remote feed uses.

pub mod artifacts;
pub mod http;
pub mod memory;
pub mod postgres;
pub mod store;

pub use artifacts::{sha256_hex, ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, JsonResponse, RetryDisposition,
};
pub use memory::{DimensionRow, MemoryStore};
pub use postgres::PgStore;
pub use store::{AirportEntry, InsertOutcome, ReconStore, StoreError, UnitOfWork};

pub const CRATE_NAME: &str = "recon-storage";
