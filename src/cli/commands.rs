use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Prefetch the dependencies of a repository into a deterministic bundle
#[derive(Parser, Debug)]
#[command(
    name = "vendorbox",
    about = "Prefetch the dependencies of a repository into a deterministic bundle",
    version,
    author,
    long_about = "vendorbox fetches a repository at an exact revision, resolves its Go \
                  module, npm and pip dependencies, and writes the source plus every \
                  dependency into a reproducible bundle for network-isolated builds."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Resolve a repository's dependencies and write the bundle",
        long_about = "Runs the complete pipeline locally: fetches the source, resolves every \
                      requested package manager, applies replacements and writes the bundle.\n\n\
                      Examples:\n  \
                      vendorbox vendor --repo https://github.com/org/app --ref <40-hex sha>\n  \
                      vendorbox vendor --repo ... --ref ... --pkg-manager npm --pkg-manager pip\n  \
                      vendorbox vendor --repo ... --ref ... --replace rsc.io/quote:gomod:v1.5.2=example.com/quote"
    )]
    Vendor(VendorArgs),

    #[command(about = "Show the effective configuration")]
    Config(ConfigArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct VendorArgs {
    #[arg(long, value_name = "URL", help = "Repository to fetch")]
    pub repo: String,

    #[arg(long = "ref", value_name = "SHA", help = "Full 40 character revision")]
    pub git_ref: String,

    #[arg(
        short = 'p',
        long = "pkg-manager",
        value_name = "NAME",
        help = "Package manager to resolve (gomod, npm, pip); repeatable"
    )]
    pub pkg_managers: Vec<String>,

    #[arg(
        long = "replace",
        value_name = "NAME:TYPE:VERSION=NEW_NAME",
        help = "Dependency replacement; repeatable"
    )]
    pub replacements: Vec<String>,

    #[arg(long = "flag", value_name = "FLAG", help = "Request flag; repeatable")]
    pub flags: Vec<String>,

    #[arg(
        short = 'o',
        long,
        value_name = "FILE",
        help = "Copy the bundle here (defaults to the bundles directory)"
    )]
    pub output: Option<PathBuf>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}
