//! On-disk cache of model weights, verified by size and SHA-256.
//!
//! Weights are fetched on first use and staged next to the target file
//! so a crash mid-download never leaves a plausible-but-corrupt blob
//! where consumers look for it. At most one download runs per profile.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::digest;
use crate::error::{Error, Result};
use crate::fetcher::WeightFetcher;
use crate::manifest::{Manifest, ManifestEntry};
use crate::profile::ModelProfile;

/// Download progress for a profile's weights: `(profile, bytes, total)`.
/// Called from the fetcher's thread.
pub type WeightProgress = Arc<dyn Fn(ModelProfile, u64, u64) + Send + Sync>;

/// A ready-to-load weight blob on disk.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub profile: ModelProfile,
    pub weights_path: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,

    /// False when this call had to download the blob
    pub was_cached: bool,
}

pub struct ModelCache {
    root: PathBuf,
    fetcher: Arc<dyn WeightFetcher>,
    manifest: Manifest,
    on_progress: Option<WeightProgress>,

    // One download guard per profile; the outer map has its own lock
    // so guards can be created lazily without racing.
    locks: Mutex<HashMap<ModelProfile, Arc<Mutex<()>>>>,
}

impl ModelCache {
    pub fn new(
        root: PathBuf,
        fetcher: Arc<dyn WeightFetcher>,
        manifest: Manifest,
        on_progress: Option<WeightProgress>,
    ) -> Self {
        Self {
            root,
            fetcher,
            manifest,
            on_progress,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Guarantee the profile's weights are on disk with the declared
    /// size and digest, downloading them if necessary.
    pub fn ensure_ready(&self, profile: ModelProfile) -> Result<ModelHandle> {
        let entry = self.manifest.find(profile).ok_or_else(|| {
            Error::Config(format!("Profile missing from manifest: {}", profile.key()))
        })?;
        let target = self.weights_path(entry);

        // Cheap path, no lock: most calls find a verified blob.
        if self.file_ready(&target, entry)? {
            return Ok(self.handle_for(profile, entry, &target, true));
        }

        let guard = self.lock_for(profile);
        let _serialized = guard.lock().unwrap_or_else(PoisonError::into_inner);

        // Another job may have finished the download while we waited.
        if self.file_ready(&target, entry)? {
            return Ok(self.handle_for(profile, entry, &target, true));
        }

        self.download_and_stage(profile, entry, &target)
    }

    /// Remove the profile's cache directory.
    pub fn purge(&self, profile: ModelProfile) -> Result<()> {
        let entry = self.manifest.find(profile).ok_or_else(|| {
            Error::Config(format!("Profile missing from manifest: {}", profile.key()))
        })?;
        remove_dir_if_present(&self.root.join(&entry.profile_key))
    }

    /// Remove the whole cache root.
    pub fn purge_all(&self) -> Result<()> {
        remove_dir_if_present(&self.root)
    }

    fn weights_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.root.join(&entry.profile_key).join(&entry.filename)
    }

    fn handle_for(
        &self,
        profile: ModelProfile,
        entry: &ManifestEntry,
        target: &Path,
        was_cached: bool,
    ) -> ModelHandle {
        ModelHandle {
            profile,
            weights_path: target.to_path_buf(),
            sha256: entry.sha256.clone(),
            size_bytes: entry.size_bytes,
            was_cached,
        }
    }

    fn lock_for(&self, profile: ModelProfile) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(profile).or_default())
    }

    /// Whether `path` holds a blob matching the manifest entry. A file
    /// with the right size but the wrong digest is deleted on sight.
    fn file_ready(&self, path: &Path, entry: &ManifestEntry) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }

        if entry.size_bytes > 0 {
            let size = fs::metadata(path)
                .map_err(|e| Error::Cache(format!("Failed to inspect model file: {}", e)))?
                .len();
            if size != entry.size_bytes {
                return Ok(false);
            }
        }

        if digest::verify(path, &entry.sha256)? {
            return Ok(true);
        }

        log::warn!(
            "ensure_ready: checksum mismatch for {:?}, discarding cached file",
            path
        );
        fs::remove_file(path).ok();
        Ok(false)
    }

    fn download_and_stage(
        &self,
        profile: ModelProfile,
        entry: &ManifestEntry,
        target: &Path,
    ) -> Result<ModelHandle> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Cache(format!("Failed to create cache directories: {}", e)))?;
        }

        let staging = staging_path(target);
        if staging.exists() {
            fs::remove_file(&staging).ok();
        }

        log::info!(
            "ensure_ready: downloading {} weights from {}",
            profile.key(),
            entry.url
        );

        let forward = self
            .on_progress
            .clone()
            .map(|sink| move |done: u64, total: u64| sink(profile, done, total));

        let fetched = self.fetcher.fetch(
            &entry.url,
            &staging,
            forward
                .as_ref()
                .map(|f| f as &(dyn Fn(u64, u64) + Send + Sync)),
        );
        if let Err(e) = fetched {
            fs::remove_file(&staging).ok();
            return Err(e);
        }

        if entry.size_bytes > 0 {
            let size = match fs::metadata(&staging) {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    fs::remove_file(&staging).ok();
                    return Err(Error::Cache(format!(
                        "Failed to inspect downloaded weights: {}",
                        e
                    )));
                }
            };
            if size != entry.size_bytes {
                fs::remove_file(&staging).ok();
                return Err(Error::Cache(format!(
                    "Downloaded weights size mismatch: expected {} bytes, got {}",
                    entry.size_bytes, size
                )));
            }
        }

        match digest::verify(&staging, &entry.sha256) {
            Ok(true) => {}
            Ok(false) => {
                fs::remove_file(&staging).ok();
                return Err(Error::Cache(
                    "Checksum mismatch for downloaded weights".into(),
                ));
            }
            Err(e) => {
                fs::remove_file(&staging).ok();
                return Err(e);
            }
        }

        if target.exists() {
            if let Err(e) = fs::remove_file(target) {
                fs::remove_file(&staging).ok();
                return Err(Error::Cache(format!(
                    "Failed to replace existing weights: {}",
                    e
                )));
            }
        }
        if let Err(e) = fs::rename(&staging, target) {
            fs::remove_file(&staging).ok();
            return Err(Error::Cache(format!(
                "Failed to finalize cached weights: {}",
                e
            )));
        }

        log::info!("ensure_ready: cached {} weights at {:?}", profile.key(), target);
        Ok(self.handle_for(profile, entry, target, false))
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Cache(format!("Failed to purge {:?}: {}", dir, e))),
    }
}
