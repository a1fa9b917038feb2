pub mod commands;
pub mod handlers;
pub mod output;

pub use commands::{CliArgs, Commands, ConfigArgs, VendorArgs};
pub use output::{OutputFormat, OutputFormatter};
