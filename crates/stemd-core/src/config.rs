//! Per-job configuration: the base template, per-submission overrides,
//! and the optional JSON job configuration file.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::profile::ModelProfile;

/// Base configuration applied to every submission before overrides.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    /// Which model profile to run
    pub profile: ModelProfile,

    /// Optional subset of the profile's stems; empty means all of them
    pub stems_filter: Vec<String>,
}

impl Default for JobTemplate {
    fn default() -> Self {
        Self {
            profile: ModelProfile::BalancedSixStem,
            stems_filter: Vec::new(),
        }
    }
}

/// Shape of the optional job configuration file. Unknown keys are
/// ignored so configs can carry app-specific extras.
#[derive(Deserialize)]
struct JobConfigDoc {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stems: Option<Vec<String>>,
}

impl JobTemplate {
    /// Stems this template will produce: the filter when set, the full
    /// profile list otherwise.
    pub fn resolved_stems(&self) -> Vec<String> {
        if !self.stems_filter.is_empty() {
            return self.stems_filter.clone();
        }
        self.profile.stems().iter().map(|s| s.to_string()).collect()
    }

    /// Load a template from a JSON file of shape
    /// `{ "model": "<profile-key>"?, "stems": ["name", ...]? }`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read job config {:?}: {}", path, e)))?;
        Self::from_json(&text)
    }

    /// Parse a template from a JSON document string.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: JobConfigDoc = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Malformed job config: {}", e)))?;

        let mut config = Self::default();

        if let Some(key) = &doc.model {
            config.profile = ModelProfile::from_key(key)
                .ok_or_else(|| Error::Config(format!("Unknown model profile: {}", key)))?;
        }

        if let Some(stems) = doc.stems {
            for stem in &stems {
                if !config.profile.supports_stem(stem) {
                    return Err(Error::Config(format!("Unsupported stem: {}", stem)));
                }
            }
            config.stems_filter = stems;
        }

        Ok(config)
    }
}

/// Per-submission overrides layered on top of the template.
#[derive(Debug, Clone, Default)]
pub struct JobOverrides {
    pub profile: Option<ModelProfile>,
    pub stems_filter: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_resolves_all_stems() {
        let template = JobTemplate::default();
        assert_eq!(template.profile, ModelProfile::BalancedSixStem);
        assert_eq!(template.resolved_stems().len(), 6);
    }

    #[test]
    fn test_from_json_with_model_and_stems() {
        let template = JobTemplate::from_json(
            r#"{ "model": "balanced-four-stem", "stems": ["vocals", "drums"] }"#,
        )
        .unwrap();
        assert_eq!(template.profile, ModelProfile::BalancedFourStem);
        assert_eq!(template.resolved_stems(), vec!["vocals", "drums"]);
    }

    #[test]
    fn test_from_json_ignores_unknown_keys() {
        let template =
            JobTemplate::from_json(r#"{ "model": "balanced-six-stem", "extra": 42 }"#).unwrap();
        assert_eq!(template.profile, ModelProfile::BalancedSixStem);
    }

    #[test]
    fn test_from_json_rejects_unknown_profile() {
        let err = JobTemplate::from_json(r#"{ "model": "turbo-stem" }"#).unwrap_err();
        assert!(err.to_string().contains("Unknown model profile"));
    }

    #[test]
    fn test_from_json_rejects_unsupported_stem() {
        // piano is a 6-stem output, not a 4-stem one
        let err = JobTemplate::from_json(
            r#"{ "model": "balanced-four-stem", "stems": ["piano"] }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unsupported stem"));
    }
}
