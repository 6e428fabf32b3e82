use std::fmt;

use serde::{Deserialize, Serialize};

const AUTHN_CONTEXT_PREFIX: &str = "urn:uk:gov:cabinet-office:tc:saml:authn-context:level";

/// Identity assurance level, ordered from weakest to strongest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LevelOfAssurance {
    #[serde(rename = "LEVEL_1")]
    Level1,
    #[default]
    #[serde(rename = "LEVEL_2")]
    Level2,
    #[serde(rename = "LEVEL_3")]
    Level3,
    #[serde(rename = "LEVEL_4")]
    Level4,
}

impl LevelOfAssurance {
    fn number(self) -> u8 {
        match self {
            LevelOfAssurance::Level1 => 1,
            LevelOfAssurance::Level2 => 2,
            LevelOfAssurance::Level3 => 3,
            LevelOfAssurance::Level4 => 4,
        }
    }

    /// The authentication context class ref for this level.
    pub fn authn_context(self) -> String {
        format!("{AUTHN_CONTEXT_PREFIX}{}", self.number())
    }

    /// Parse an authentication context class ref.
    pub fn from_authn_context(class_ref: &str) -> Option<Self> {
        match class_ref.trim().strip_prefix(AUTHN_CONTEXT_PREFIX)? {
            "1" => Some(LevelOfAssurance::Level1),
            "2" => Some(LevelOfAssurance::Level2),
            "3" => Some(LevelOfAssurance::Level3),
            "4" => Some(LevelOfAssurance::Level4),
            _ => None,
        }
    }
}

impl fmt::Display for LevelOfAssurance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LEVEL_{}", self.number())
    }
}
