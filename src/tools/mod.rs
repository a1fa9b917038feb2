//! Access to the outside world: external commands, registries, retries, cancellation

pub mod cancel;
pub mod command;
pub mod download;
pub mod mock;
pub mod retry;

pub use cancel::{CancelSignal, CancellationRegistry};
pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use download::{ArtifactFetcher, HttpFetcher};
pub use mock::{MockFetcher, MockRunner};
pub use retry::RetryPolicy;
