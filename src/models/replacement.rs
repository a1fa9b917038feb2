use super::{Ecosystem, Package};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-supplied directive renaming one resolved dependency
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Replacement {
    pub name: String,
    #[serde(rename = "type")]
    pub ecosystem: Ecosystem,
    pub version: String,
    pub new_name: String,
}

impl Replacement {
    pub fn new(
        name: impl Into<String>,
        ecosystem: Ecosystem,
        version: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            ecosystem,
            version: version.into(),
            new_name: new_name.into(),
        }
    }

    /// The package this directive targets
    pub fn original(&self) -> Package {
        Package::new(self.name.clone(), self.ecosystem, self.version.clone())
    }

    /// The package that takes the original's place
    pub fn replacement(&self) -> Package {
        Package::new(self.new_name.clone(), self.ecosystem, self.version.clone())
    }

    /// Parses the `NAME:TYPE:VERSION=NEW_NAME` form used on the command line
    pub fn parse_directive(directive: &str) -> Option<Self> {
        let (target, new_name) = directive.rsplit_once('=')?;
        let mut parts = target.rsplitn(3, ':');
        let version = parts.next()?;
        let ecosystem = Ecosystem::from_tag(parts.next()?)?;
        let name = parts.next()?;
        if name.is_empty() || version.is_empty() || new_name.is_empty() {
            return None;
        }
        Some(Self::new(name, ecosystem, version, new_name))
    }
}

impl fmt::Display for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{} => {}",
            self.ecosystem, self.name, self.version, self.new_name
        )
    }
}
