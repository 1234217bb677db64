//! Archive extraction and single file decompression
//!
//! Blocking; called from `spawn_blocking`. Both operations read from an
//! already open file so that the content cannot be swapped or deleted
//! between lookup and use.

use crate::error::{WardenError, WardenResult};
use crate::fsutil;
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use lz4_flex::frame::FrameDecoder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use tracing::debug;
use xz2::read::XzDecoder;

/// Archive formats a directory mount can be populated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "tar.gz")]
    TarGz,
    #[serde(rename = "tar.bz2")]
    TarBz2,
    #[serde(rename = "tar.xz")]
    TarXz,
    #[serde(rename = "tar.lz4")]
    TarLz4,
    #[serde(rename = "tar.zst")]
    TarZst,
    #[serde(rename = "zip")]
    Zip,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::TarXz => "tar.xz",
            Self::TarLz4 => "tar.lz4",
            Self::TarZst => "tar.zst",
            Self::Zip => "zip",
        })
    }
}

/// Compression of a single file mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gz,
    Bz2,
    Xz,
    Lz4,
    Zst,
}

/// Wrap `input` in the decoder for `compression`
fn decoder<'a>(
    input: impl Read + 'a,
    compression: Option<Compression>,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        None => Box::new(input),
        Some(Compression::Gz) => Box::new(GzDecoder::new(input)),
        Some(Compression::Bz2) => Box::new(BzDecoder::new(input)),
        Some(Compression::Xz) => Box::new(XzDecoder::new(input)),
        Some(Compression::Lz4) => Box::new(FrameDecoder::new(input)),
        Some(Compression::Zst) => Box::new(zstd::stream::read::Decoder::new(input)?),
    })
}

/// Unpack `archive` (opened from `name`) into `dir`, creating `dir` if
/// needed. Entries that would land outside `dir` are refused by the tar and
/// zip readers.
pub fn extract(archive: File, name: &Path, format: ArchiveFormat, dir: &Path) -> WardenResult<()> {
    debug!(
        "Extracting {} file {} to {}",
        format,
        name.display(),
        dir.display()
    );
    let fail = |reason: String| WardenError::Archive {
        path: name.to_path_buf(),
        reason,
    };

    std::fs::create_dir_all(dir)
        .map_err(|e| WardenError::io(format!("creating directory {}", dir.display()), e))?;

    let compression = match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(BufReader::new(archive))
                .map_err(|e| fail(e.to_string()))?;
            return zip.extract(dir).map_err(|e| fail(e.to_string()));
        }
        ArchiveFormat::Tar => None,
        ArchiveFormat::TarGz => Some(Compression::Gz),
        ArchiveFormat::TarBz2 => Some(Compression::Bz2),
        ArchiveFormat::TarXz => Some(Compression::Xz),
        ArchiveFormat::TarLz4 => Some(Compression::Lz4),
        ArchiveFormat::TarZst => Some(Compression::Zst),
    };

    let reader = decoder(BufReader::new(archive), compression).map_err(|e| fail(e.to_string()))?;
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dir).map_err(|e| fail(e.to_string()))
}

/// Write `source` (opened from `name`) to `target`, decompressing it if
/// `compression` is given. A symlink at `target` is never followed.
pub fn decompress(
    source: File,
    name: &Path,
    compression: Option<Compression>,
    target: &Path,
) -> WardenResult<u64> {
    let fail = |e: io::Error| WardenError::Archive {
        path: name.to_path_buf(),
        reason: e.to_string(),
    };

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| WardenError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let mut reader = decoder(BufReader::new(source), compression).map_err(fail)?;
    let mut output = fsutil::create_no_follow(target)
        .map_err(|e| WardenError::io(format!("creating {}", target.display()), e))?;
    io::copy(&mut reader, &mut output).map_err(fail)
}
