//! vendorbox - dependency prefetching for network-isolated builds
//!
//! A request names a repository, an exact revision and the package managers in use.
//! vendorbox fetches the source, resolves every Go module, npm and pip dependency,
//! applies any requested replacements and publishes the source plus all dependencies
//! as one deterministic `tar.gz` bundle.
//!
//! # Core Concepts
//!
//! - **Request**: a persistent record moving from `in_progress` to `complete`,
//!   `failed` or `stale`, with an append-only audit trail of transitions
//! - **Resolver**: one ecosystem's strategy for enumerating and downloading
//!   dependencies into a staging directory
//! - **Source cache**: one archive per `(repository, revision)`, shared by requests
//! - **Bundle**: the published archive, byte-identical for identical inputs
//!
//! # Example Usage
//!
//! ```ignore
//! use vendorbox::api::{Caller, NewRequestBody, RequestService};
//!
//! let detail = service.create(&Caller::user("alice"), body).await?;
//! println!("Request {} is {}", detail.id, detail.state);
//! ```
//!
//! # Project Structure
//!
//! - [`api`]: request submission, listing, patching and download
//! - [`pipeline`]: the phases a worker runs for one request
//! - [`resolvers`]: Go module, npm and pip dependency resolution
//! - [`store`]: request persistence with compare-and-set state changes

pub mod api;
pub mod archive;
pub mod bundle;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod replacements;
pub mod resolvers;
pub mod scm;
pub mod state;
pub mod store;
pub mod sweep;
pub mod tools;
pub mod util;
pub mod worker;

pub use api::{Caller, RequestService};
pub use config::{ConfigError, VendorboxConfig};
pub use error::{Result, ToolError, VendorError};
pub use models::{Dependency, Ecosystem, Package, Replacement, Request, RequestDetail};
pub use pipeline::PipelineOrchestrator;
pub use state::RequestState;
pub use store::{InMemoryRequestStore, RequestStore};
pub use util::{init_default, init_from_env, init_logging, LoggingConfig};
pub use worker::{JobQueue, WorkerPool};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_exists() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name_is_vendorbox() {
        assert_eq!(NAME, "vendorbox");
    }
}
