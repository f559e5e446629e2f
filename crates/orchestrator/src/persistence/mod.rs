//! SurrealDB connection layer.
//!
//! - `OrchestratorStore`: connection management, schema setup and health checks
//! - `PersistenceError`: storage failures with transient/permanent classification
//!
//! The job and event tables defined in `schema.surql` are read and written
//! by [`crate::store::SurrealStore`].
//!
//! # Example
//!
//! ```ignore
//! use orchestrator::persistence::{OrchestratorStore, StoreConfig};
//!
//! let store = OrchestratorStore::connect(StoreConfig::in_memory()).await?;
//! store.initialize_schema().await?;
//! ```

pub mod client;
pub mod error;

pub use client::{Credentials, OrchestratorStore, StoreConfig};
pub use error::{PersistenceError, PersistenceResult, from_surrealdb_error};
