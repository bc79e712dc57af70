//! Merge heart-rate samples from one FIT activity recording into another.
//!
//! The base file keeps its structure and every field; record messages whose
//! timestamp appears in the source file take the source's heart rate.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub mod codec;
pub mod inspect;
pub mod merge;
pub mod profile;
pub mod sample;

#[cfg(test)]
mod testutil;

pub use codec::{
    decode, decode_with, encode, ActivityFile, DecodeError, DecodeOptions, EncodeError,
};
pub use inspect::{inspect, Inspection};
pub use merge::{
    apply, apply_heart_rate, build_source_index, check_alignment, merge_bytes, Alignment,
    MergeOptions, MergeOutcome, MergeStats, SourceEntry, SourceIndex,
};
pub use sample::{Sample, SampleMut};

/// Which input a failure came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Base,
    Source,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Base => f.write_str("base"),
            Role::Source => f.write_str("source"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("failed to decode {role} file: {source}")]
    Decode {
        role: Role,
        #[source]
        source: DecodeError,
    },
    #[error("failed to encode merged file: {0}")]
    Encode(#[from] EncodeError),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("base and source are not aligned: {0}")]
    Misaligned(String),
    #[error("failed to inspect FIT file: {0}")]
    Inspect(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeReport {
    pub base: PathBuf,
    pub source: PathBuf,
    pub output: PathBuf,
    pub options: MergeOptions,
    pub stats: MergeStats,
    pub first_matched_at: Option<DateTime<Utc>>,
    pub last_matched_at: Option<DateTime<Utc>>,
}

/// Merge `source` into `base` and write the result to `output`.
///
/// The output is only written once the whole merge has succeeded, and it is
/// written to a sibling file first and renamed into place.
pub fn run(
    base: &Path,
    source: &Path,
    output: &Path,
    options: &MergeOptions,
) -> Result<MergeReport, MergeError> {
    let base_bytes = read_file(base)?;
    let source_bytes = read_file(source)?;
    let outcome = merge_bytes(&base_bytes, &source_bytes, options)?;
    write_atomic(output, &outcome.bytes)?;

    let stats = outcome.stats;
    info!(
        "Merged {} of {} samples ({} matched, {} heart rates, {} powers); written to {}",
        stats.samples_updated,
        stats.base_samples,
        stats.matched,
        stats.heart_rate_updated,
        stats.power_updated,
        output.display()
    );

    Ok(MergeReport {
        base: base.to_path_buf(),
        source: source.to_path_buf(),
        output: output.to_path_buf(),
        options: options.clone(),
        stats,
        first_matched_at: stats.first_matched.and_then(profile::fit_time_to_utc),
        last_matched_at: stats.last_matched.and_then(profile::fit_time_to_utc),
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>, MergeError> {
    fs::read(path).map_err(|source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MergeError> {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("merged.fit"));
    name.push(".partial");
    let partial = path.with_file_name(name);
    fs::write(&partial, bytes).map_err(|source| {
        let _ = fs::remove_file(&partial);
        MergeError::Io {
            path: partial.clone(),
            source,
        }
    })?;
    fs::rename(&partial, path).map_err(|source| {
        let _ = fs::remove_file(&partial);
        MergeError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}
