// Pipeline phases, executed strictly in order for every request.
//
// Each phase reads what the previous ones left in the RequestContext and adds its own
// output. A phase error ends the request.

#[path = "01_fetch.rs"]
pub mod fetch;
#[path = "02_resolve.rs"]
pub mod resolve;
#[path = "03_merge.rs"]
pub mod merge;
#[path = "04_replace.rs"]
pub mod replace;
#[path = "05_assemble.rs"]
pub mod assemble;

pub use assemble::AssemblePhase;
pub use fetch::FetchPhase;
pub use merge::MergePhase;
pub use replace::ReplacePhase;
pub use resolve::ResolvePhase;
