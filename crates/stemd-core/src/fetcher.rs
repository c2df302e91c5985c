//! Weight fetching over HTTP.
//!
//! The fetcher is a capability trait so tests and embedders can swap
//! the transport; the default implementation streams with `ureq`.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Byte-level progress: `(bytes_downloaded, total_bytes)`. Total is
/// zero when the server does not announce a content length.
pub type FetchProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Streams a weight blob from a URL to a destination path.
pub trait WeightFetcher: Send + Sync {
    fn fetch(&self, url: &str, destination: &Path, progress: Option<FetchProgress>) -> Result<()>;
}

/// Blocking HTTP fetcher backed by ureq.
pub struct HttpWeightFetcher {
    agent: ureq::Agent,
}

impl HttpWeightFetcher {
    pub fn new() -> Self {
        // Weight blobs run to hundreds of megabytes; the overall
        // timeout has to cover a slow link end to end.
        Self::with_timeout(Duration::from_secs(3600))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout(timeout)
            .build();
        Self { agent }
    }
}

impl Default for HttpWeightFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightFetcher for HttpWeightFetcher {
    fn fetch(&self, url: &str, destination: &Path, progress: Option<FetchProgress>) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        log::info!("fetch: downloading {} to {:?}", url, destination);

        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let total: u64 = response
            .header("Content-Length")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let mut reader = response.into_reader();
        let mut file = fs::File::create(destination)?;
        let mut buffer = [0u8; 8192];
        let mut downloaded: u64 = 0;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])?;
            downloaded += n as u64;
            if let Some(cb) = progress {
                cb(downloaded, total);
            }
        }
        file.flush()?;

        log::info!("fetch: wrote {} bytes to {:?}", downloaded, destination);
        Ok(())
    }
}
