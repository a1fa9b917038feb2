//! Resolved packages and the dependencies a request owns

use super::Ecosystem;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A resolved artifact within one ecosystem
///
/// Identity is the `(name, type, version)` triple; `integrity` is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(rename = "type")]
    pub ecosystem: Ecosystem,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl Package {
    pub fn new(name: impl Into<String>, ecosystem: Ecosystem, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ecosystem,
            version: version.into(),
            integrity: None,
        }
    }

    pub fn with_integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    fn key(&self) -> (Ecosystem, &str, &str) {
        (self.ecosystem, &self.name, &self.version)
    }

    pub fn matches(&self, name: &str, ecosystem: Ecosystem, version: &str) -> bool {
        self.ecosystem == ecosystem && self.name == name && self.version == version
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Package {}

impl Hash for Package {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Package {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Package {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.ecosystem, self.name, self.version)
    }
}

/// A package required by a request, possibly standing in for another one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(flatten)]
    pub package: Package,
    #[serde(default)]
    pub replaces: Option<Package>,
}

impl Dependency {
    pub fn new(package: Package) -> Self {
        Self {
            package,
            replaces: None,
        }
    }

    pub fn replacing(package: Package, original: Package) -> Self {
        Self {
            package,
            replaces: Some(original),
        }
    }

    pub fn name(&self) -> &str {
        &self.package.name
    }

    pub fn ecosystem(&self) -> Ecosystem {
        self.package.ecosystem
    }

    pub fn version(&self) -> &str {
        &self.package.version
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.package == other.package
    }
}

impl Eq for Dependency {}

impl Hash for Dependency {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.package.hash(state);
    }
}

impl PartialOrd for Dependency {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dependency {
    fn cmp(&self, other: &Self) -> Ordering {
        self.package.cmp(&other.package)
    }
}
