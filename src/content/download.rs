//! Fetching content into the downloads directory
//!
//! URL downloads are retried with jittered exponential backoff on
//! connection failures, interrupted bodies and 5xx responses. Any other
//! response is final. The body is streamed to disk inside the retry loop so
//! a dropped connection halfway through a large download is retried too.

use crate::config::schema::HttpConfig;
use crate::error::{WardenError, WardenResult};
use crate::fsutil;
use base64::Engine;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of a single GET
#[derive(Debug)]
enum Attempt {
    /// Worth trying again
    Transient(String),
    /// Will fail the same way again
    Permanent(String),
}

/// Download `url` to `dest` (mode 0600), returning bytes written
pub async fn fetch_url(
    url: &str,
    source_desc: &str,
    dest: &Path,
    http: &HttpConfig,
) -> WardenResult<u64> {
    use rand::Rng;

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(http.timeout_secs)))
        .build()
        .into();

    let mut retries = 0;
    loop {
        info!("[mounts] Downloading {} to {}", source_desc, dest.display());

        let result = {
            let agent = agent.clone();
            let url = url.to_string();
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || get_once(&agent, &url, &dest))
                .await
                .map_err(|e| WardenError::internal(format!("download task failed: {}", e)))?
        };

        match result {
            Ok(bytes) => return Ok(bytes),
            Err(Attempt::Transient(reason)) if retries < http.max_retries => {
                retries += 1;

                let base_backoff = Duration::from_millis(
                    http.initial_backoff_ms
                        .saturating_mul(1u64 << (retries - 1).min(16)),
                )
                .min(Duration::from_secs(http.max_backoff_secs));
                let jittered_ms =
                    rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
                let backoff = Duration::from_millis(jittered_ms.max(10));

                warn!(
                    error = %reason,
                    retry = retries,
                    max_retries = http.max_retries,
                    backoff_ms = backoff.as_millis(),
                    "[mounts] Download of {} failed on this attempt",
                    source_desc
                );

                tokio::time::sleep(backoff).await;
            }
            Err(Attempt::Transient(reason)) | Err(Attempt::Permanent(reason)) => {
                // Never leave a partial body behind
                let _ = fsutil::remove_path(dest);
                return Err(WardenError::download(source_desc, reason));
            }
        }
    }
}

fn get_once(agent: &ureq::Agent, url: &str, dest: &Path) -> Result<u64, Attempt> {
    let mut response = agent.get(url).call().map_err(|e| match e {
        ureq::Error::BadUri(reason) => Attempt::Permanent(format!("invalid url: {}", reason)),
        other => Attempt::Transient(other.to_string()),
    })?;

    let status = response.status();
    if status.is_server_error() {
        return Err(Attempt::Transient(format!("HTTP status {}", status)));
    }
    if !status.is_success() {
        return Err(Attempt::Permanent(format!("HTTP status {}", status)));
    }

    let mut file = fsutil::create_private_file(dest)
        .map_err(|e| Attempt::Permanent(format!("could not open {}: {}", dest.display(), e)))?;
    let mut body = response.body_mut().as_reader();
    let bytes = io::copy(&mut body, &mut file).map_err(|e| {
        Attempt::Transient(format!(
            "could not write http response to {}: {}",
            dest.display(),
            e
        ))
    })?;
    file.flush()
        .map_err(|e| Attempt::Permanent(format!("could not flush {}: {}", dest.display(), e)))?;
    Ok(bytes)
}

/// Write literal content to `dest` (mode 0600)
pub async fn write_literal(bytes: Vec<u8>, source_desc: &str, dest: &Path) -> WardenResult<u64> {
    info!("[mounts] Copying {} to {}", source_desc, dest.display());
    let path: PathBuf = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> io::Result<u64> {
        let mut file = fsutil::create_private_file(&path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(bytes.len() as u64)
    })
    .await
    .map_err(|e| WardenError::internal(format!("write task failed: {}", e)))?
    .map_err(|e| WardenError::io(format!("writing {}", dest.display()), e))
}

/// Decode standard base64, ignoring surrounding whitespace
pub fn decode_base64(encoded: &str) -> WardenResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| WardenError::InvalidBase64(e.to_string()))
}
