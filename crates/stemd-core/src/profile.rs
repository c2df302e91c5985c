//! Model profiles available to separation jobs
//!
//! A profile determines both which weight blob to load and which stems
//! the separation can produce. Profiles are process-wide constants.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named model configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelProfile {
    /// Hybrid transformer Demucs, 4 stems (vocals, drums, bass, other)
    BalancedFourStem,

    /// 6-stem variant, adds piano and guitar
    BalancedSixStem,
}

impl ModelProfile {
    /// Stable config key, e.g. `"balanced-six-stem"`
    pub fn key(&self) -> &'static str {
        match self {
            Self::BalancedFourStem => "balanced-four-stem",
            Self::BalancedSixStem => "balanced-six-stem",
        }
    }

    /// Human readable label for UIs and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::BalancedFourStem => "Balanced 4-Stem",
            Self::BalancedSixStem => "Balanced 6-Stem",
        }
    }

    /// Weight file name (must match the manifest, since the cache
    /// stores the blob under this name)
    pub fn weight_filename(&self) -> &'static str {
        match self {
            Self::BalancedFourStem => "ggml-model-htdemucs-4s-f16.bin",
            Self::BalancedSixStem => "ggml-model-htdemucs-6s-f16.bin",
        }
    }

    /// Ordered list of stems this profile produces
    pub fn stems(&self) -> &'static [&'static str] {
        match self {
            Self::BalancedFourStem => &["vocals", "drums", "bass", "other"],
            Self::BalancedSixStem => &["vocals", "drums", "bass", "piano", "guitar", "other"],
        }
    }

    /// Whether `stem` is one of this profile's output stems
    pub fn supports_stem(&self, stem: &str) -> bool {
        self.stems().iter().any(|s| *s == stem)
    }

    /// Look up a profile by its stable key
    pub fn from_key(key: &str) -> Option<Self> {
        Self::all().iter().copied().find(|profile| profile.key() == key)
    }

    /// All registered profiles
    pub fn all() -> &'static [Self] {
        &[Self::BalancedFourStem, Self::BalancedSixStem]
    }
}

impl fmt::Display for ModelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        for profile in ModelProfile::all() {
            assert_eq!(ModelProfile::from_key(profile.key()), Some(*profile));
        }
        assert_eq!(ModelProfile::from_key("nope"), None);
    }

    #[test]
    fn test_stem_lists() {
        assert_eq!(ModelProfile::BalancedFourStem.stems().len(), 4);
        assert_eq!(ModelProfile::BalancedSixStem.stems().len(), 6);
        assert!(ModelProfile::BalancedSixStem.supports_stem("piano"));
        assert!(!ModelProfile::BalancedFourStem.supports_stem("piano"));
    }

    #[test]
    fn test_serde_kebab_case() {
        let json = serde_json::to_string(&ModelProfile::BalancedFourStem).unwrap();
        assert_eq!(json, "\"balanced-four-stem\"");
    }
}
