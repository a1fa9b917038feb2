//! Data model shared by the pipeline, the store and the request surface

#[macro_use]
mod id_enum_macro;

pub mod ecosystem;
pub mod package;
pub mod replacement;
pub mod request;

pub use ecosystem::Ecosystem;
pub use package::{Dependency, Package};
pub use replacement::Replacement;
pub use request::{BundleRef, NewRequest, Request, RequestDetail, RequestView};
