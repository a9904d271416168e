//! Capability classification.
//!
//! On the wire a runtime advertises capabilities as an open string→info map;
//! internally routing only ever deals with this closed set. Unknown kinds are
//! dropped at the parse boundary so new runtime features never break older
//! control planes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Code,
    Shell,
    Filesystem,
    Browser,
}

impl Capability {
    /// Permissive parse: `None` for kinds this control plane does not route.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "code" => Some(Capability::Code),
            "shell" => Some(Capability::Shell),
            "filesystem" => Some(Capability::Filesystem),
            "browser" => Some(Capability::Browser),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Code => "code",
            Capability::Shell => "shell",
            Capability::Filesystem => "filesystem",
            Capability::Browser => "browser",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
