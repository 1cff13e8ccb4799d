use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Analysis mode. Orthogonal cache-key dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Personalized against a profile, larger model.
    Full,
    /// Generic, no profile, smaller model.
    Basic,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Full => "full",
            Mode::Basic => "basic",
        }
    }

    pub fn uses_profile(&self) -> bool {
        matches!(self, Mode::Full)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Mode::Full),
            "basic" => Ok(Mode::Basic),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

pub const SONNET_MODEL_ID: &str = "claude-sonnet-4-5-20250929";
pub const HAIKU_MODEL_ID: &str = "claude-haiku-4-5-20250929";

/// Model and output budget used for one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model: String,
    pub max_tokens: u32,
}

/// Configuration table `mode -> {model, max_tokens}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTable {
    pub full: ModelSpec,
    pub basic: ModelSpec,
}

impl Default for ModelTable {
    fn default() -> Self {
        Self {
            full: ModelSpec {
                model: SONNET_MODEL_ID.to_string(),
                max_tokens: 2048,
            },
            basic: ModelSpec {
                model: HAIKU_MODEL_ID.to_string(),
                max_tokens: 1536,
            },
        }
    }
}

impl ModelTable {
    pub fn for_mode(&self, mode: Mode) -> &ModelSpec {
        match mode {
            Mode::Full => &self.full,
            Mode::Basic => &self.basic,
        }
    }

    pub fn model_ids(&self) -> [&str; 2] {
        [self.full.model.as_str(), self.basic.model.as_str()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_models_per_mode() {
        let table = ModelTable::default();
        assert_eq!(table.for_mode(Mode::Full).model, SONNET_MODEL_ID);
        assert_eq!(table.for_mode(Mode::Full).max_tokens, 2048);
        assert_eq!(table.for_mode(Mode::Basic).model, HAIKU_MODEL_ID);
        assert_eq!(table.for_mode(Mode::Basic).max_tokens, 1536);
    }

    #[test]
    fn test_mode_parse_and_serialize() {
        assert_eq!("FULL".parse::<Mode>().unwrap(), Mode::Full);
        assert_eq!(" basic ".parse::<Mode>().unwrap(), Mode::Basic);
        assert!("premium".parse::<Mode>().is_err());
        assert_eq!(serde_json::to_string(&Mode::Basic).unwrap(), "\"basic\"");
    }

    #[test]
    fn test_only_full_mode_uses_profile() {
        assert!(Mode::Full.uses_profile());
        assert!(!Mode::Basic.uses_profile());
    }
}
