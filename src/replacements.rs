//! Caller-supplied dependency replacements
//!
//! Directives are validated when a request is submitted, handed to resolvers that can
//! honor them while resolving (gomod), and finally applied to the merged dependency
//! set. Application is all-or-nothing: one unmatched directive fails the request.
//! Each dependency is replaced at most once, and a replacement never lands on a
//! dependency that is already present.

use crate::error::{Result, VendorError};
use crate::models::{Dependency, Ecosystem, Replacement};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Checks directives against the request's ecosystems
pub fn validate(replacements: &[Replacement], pkg_managers: &BTreeSet<Ecosystem>) -> Result<()> {
    let mut seen = HashSet::new();
    for replacement in replacements {
        if replacement.name.trim().is_empty()
            || replacement.version.trim().is_empty()
            || replacement.new_name.trim().is_empty()
        {
            return Err(VendorError::InvalidInput(
                "A dependency replacement must have a non-empty \"name\", \"version\" and \"new_name\""
                    .to_string(),
            ));
        }
        if !pkg_managers.contains(&replacement.ecosystem) {
            return Err(VendorError::InvalidInput(format!(
                "The dependency replacement type \"{}\" is not one of the requested package managers",
                replacement.ecosystem
            )));
        }
        let triple = (
            replacement.ecosystem,
            replacement.name.as_str(),
            replacement.version.as_str(),
        );
        if !seen.insert(triple) {
            return Err(VendorError::InvalidInput(format!(
                "Only one replacement is allowed for {}:{}@{}",
                replacement.ecosystem, replacement.name, replacement.version
            )));
        }
    }
    Ok(())
}

/// Directives a resolver honors while resolving `ecosystem`
pub fn pins_for(replacements: &[Replacement], ecosystem: Ecosystem) -> Vec<Replacement> {
    match ecosystem {
        Ecosystem::Gomod => replacements
            .iter()
            .filter(|r| r.ecosystem == ecosystem)
            .cloned()
            .collect(),
        Ecosystem::Npm | Ecosystem::Pip => Vec::new(),
    }
}

fn already_honored(dependency: &Dependency, replacement: &Replacement) -> bool {
    dependency.name() == replacement.new_name
        && dependency.ecosystem() == replacement.ecosystem
        && dependency.replaces.as_ref().is_some_and(|original| {
            original.matches(&replacement.name, replacement.ecosystem, &replacement.version)
        })
}

/// Applies every directive to the merged dependency set
///
/// # Errors
///
/// Returns `VendorError::Validation` naming the first directive that matches no
/// unreplaced dependency, or whose new name collides with a resolved dependency.
pub fn apply(
    dependencies: BTreeSet<Dependency>,
    replacements: &[Replacement],
) -> Result<BTreeSet<Dependency>> {
    let mut result: Vec<Dependency> = dependencies.into_iter().collect();

    for replacement in replacements {
        if result.iter().any(|d| already_honored(d, replacement)) {
            debug!(%replacement, "Replacement honored during resolution");
            continue;
        }

        let position = result.iter().position(|d| {
            d.replaces.is_none()
                && d.package
                    .matches(&replacement.name, replacement.ecosystem, &replacement.version)
        });
        let Some(position) = position else {
            return Err(VendorError::Validation(format!(
                "The dependency replacement {} did not match any resolved dependency",
                replacement
            )));
        };

        let collides = result.iter().enumerate().any(|(index, d)| {
            index != position
                && d.package
                    .matches(&replacement.new_name, replacement.ecosystem, &replacement.version)
        });
        if collides {
            return Err(VendorError::Validation(format!(
                "The dependency replacement {} would replace it with {}@{}, which is already a dependency",
                replacement, replacement.new_name, replacement.version
            )));
        }

        let original = result[position].package.clone();
        let mut renamed = original.clone();
        renamed.name = replacement.new_name.clone();
        renamed.integrity = None;
        debug!(%replacement, "Applied replacement");
        result[position] = Dependency::replacing(renamed, original);
    }

    Ok(result.into_iter().collect())
}
