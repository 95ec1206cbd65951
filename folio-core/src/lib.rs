//! # folio-core: shared types for the Folio collaboration and compile services
//!
//! ## Modules
//!
//! - [`ids`]: resource, user and document-key identifiers
//! - [`store`]: the project persistence seam ([`ProjectStore`]) with a
//!   filesystem backend and an in-memory backend for tests

pub mod ids;
pub mod store;

pub use ids::{DocumentKey, KeyError, ResourceId, UserId};
pub use store::{FsProjectStore, MemoryProjectStore, ProjectStore, StoreError};
