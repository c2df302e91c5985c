//! The model manifest: an immutable table mapping profiles to
//! downloadable weight blobs with size and digest.
//!
//! Loaded once at startup from JSON; a default manifest covering the
//! built-in profiles is compiled into the crate.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::profile::ModelProfile;

/// One downloadable weight blob.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub profile: ModelProfile,
    pub profile_key: String,
    pub filename: String,
    pub url: String,

    /// Zero when the manifest does not declare a size
    pub size_bytes: u64,

    /// Hex-encoded SHA-256 of the blob
    pub sha256: String,
}

#[derive(Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    source: Option<SourceDoc>,
    models: Vec<EntryDoc>,
}

#[derive(Deserialize)]
struct SourceDoc {
    #[serde(default)]
    url_template: Option<String>,
}

#[derive(Deserialize)]
struct EntryDoc {
    profile: String,
    filename: String,
    sha256: String,
    #[serde(default)]
    size_bytes: u64,
    #[serde(default)]
    url: Option<String>,
}

/// Immutable registry of weight blobs, keyed by profile.
#[derive(Debug)]
pub struct Manifest {
    entries: HashMap<ModelProfile, ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from already-resolved entries (primarily for
    /// tests and embedders that synthesize their own table).
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| (entry.profile, entry))
            .collect();
        Self { entries }
    }

    /// The manifest compiled into the crate.
    pub fn load_default() -> Result<Self> {
        Self::from_json(include_str!("../data/model_manifest.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read manifest {:?}: {}", path, e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let doc: ManifestDoc = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Malformed manifest: {}", e)))?;

        let url_template = doc
            .source
            .and_then(|source| source.url_template)
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(doc.models.len());
        for item in doc.models {
            let profile = ModelProfile::from_key(&item.profile).ok_or_else(|| {
                Error::Config(format!("Unknown profile in manifest: {}", item.profile))
            })?;

            let url = match item.url {
                Some(url) => url,
                None if !url_template.is_empty() => {
                    url_template.replacen("{filename}", &item.filename, 1)
                }
                None => {
                    return Err(Error::Config(format!(
                        "No URL specified for manifest entry: {}",
                        item.profile
                    )))
                }
            };

            entries.push(ManifestEntry {
                profile,
                profile_key: item.profile,
                filename: item.filename,
                url,
                size_bytes: item.size_bytes,
                sha256: item.sha256,
            });
        }

        Ok(Self::new(entries))
    }

    pub fn find(&self, profile: ModelProfile) -> Option<&ManifestEntry> {
        self.entries.get(&profile)
    }
}
