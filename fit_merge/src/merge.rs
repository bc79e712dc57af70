use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::codec::{decode_with, encode, ActivityFile, DecodeOptions};
use crate::sample::Sample;
use crate::{MergeError, Role};

/// How strictly base and source samples must line up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    /// Join on timestamp; unmatched samples pass through unchanged.
    #[default]
    BestEffort,
    /// Require identical sample counts and timestamp sequences.
    Strict,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    pub merge_heart_rate: bool,
    pub merge_power: bool,
    pub alignment: Alignment,
    pub verify_crc: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            merge_heart_rate: true,
            merge_power: false,
            alignment: Alignment::BestEffort,
            verify_crc: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub heart_rate: Option<u8>,
    pub power: Option<u16>,
}

/// Timestamp-keyed lookup built from the source file's samples.
#[derive(Clone, Debug, Default)]
pub struct SourceIndex {
    entries: HashMap<u32, SourceEntry>,
}

impl SourceIndex {
    pub fn get(&self, timestamp: u32) -> Option<&SourceEntry> {
        self.entries.get(&timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Index samples by timestamp. A later sample at the same timestamp replaces
/// an earlier one; samples without a timestamp have no key and are skipped.
pub fn build_source_index<I>(samples: I) -> SourceIndex
where
    I: IntoIterator<Item = Sample>,
{
    let mut entries = HashMap::new();
    for sample in samples {
        if let Some(timestamp) = sample.timestamp {
            entries.insert(
                timestamp,
                SourceEntry {
                    heart_rate: sample.heart_rate,
                    power: sample.power,
                },
            );
        }
    }
    SourceIndex { entries }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub base_samples: usize,
    pub matched: usize,
    /// Samples with at least one field written.
    pub samples_updated: usize,
    pub heart_rate_updated: usize,
    pub power_updated: usize,
    pub first_matched: Option<u32>,
    pub last_matched: Option<u32>,
}

/// Overwrite base heart rates from the index. Returns the number of samples
/// whose heart rate was written. Power is never touched.
pub fn apply_heart_rate(base: &mut ActivityFile, index: &SourceIndex) -> usize {
    let options = MergeOptions {
        merge_heart_rate: true,
        merge_power: false,
        ..MergeOptions::default()
    };
    apply(base, index, &options).heart_rate_updated
}

pub fn apply(base: &mut ActivityFile, index: &SourceIndex, options: &MergeOptions) -> MergeStats {
    let mut stats = MergeStats::default();
    for mut sample in base.samples_mut() {
        stats.base_samples += 1;
        let Some(timestamp) = sample.timestamp() else {
            continue;
        };
        let Some(entry) = index.get(timestamp) else {
            continue;
        };
        stats.matched += 1;
        stats.first_matched.get_or_insert(timestamp);
        stats.last_matched = Some(timestamp);

        let mut updated = false;
        if options.merge_heart_rate {
            if let Some(heart_rate) = entry.heart_rate {
                if sample.set_heart_rate(heart_rate) {
                    stats.heart_rate_updated += 1;
                    updated = true;
                    trace!(timestamp, heart_rate, "heart rate replaced");
                }
            }
        }
        if options.merge_power {
            if let Some(power) = entry.power {
                if sample.set_power(power) {
                    stats.power_updated += 1;
                    updated = true;
                    trace!(timestamp, power, "power replaced");
                }
            }
        }
        if updated {
            stats.samples_updated += 1;
        }
    }
    stats
}

/// Fail unless both files carry the same record timestamps in the same order.
pub fn check_alignment(base: &ActivityFile, source: &ActivityFile) -> Result<(), MergeError> {
    let base_times: Vec<_> = base.samples().map(|s| s.timestamp).collect();
    let source_times: Vec<_> = source.samples().map(|s| s.timestamp).collect();
    if base_times.len() != source_times.len() {
        return Err(MergeError::Misaligned(format!(
            "base has {} samples, source has {}",
            base_times.len(),
            source_times.len()
        )));
    }
    if let Some((i, (b, s))) = base_times
        .iter()
        .zip(source_times.iter())
        .enumerate()
        .find(|(_, (b, s))| b != s)
    {
        return Err(MergeError::Misaligned(format!(
            "sample {i}: base timestamp {b:?}, source timestamp {s:?}"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct MergeOutcome {
    pub bytes: Vec<u8>,
    pub stats: MergeStats,
}

/// Decode both inputs, merge the source into the base and re-encode the base.
pub fn merge_bytes(
    base: &[u8],
    source: &[u8],
    options: &MergeOptions,
) -> Result<MergeOutcome, MergeError> {
    let decode_options = DecodeOptions {
        verify_crc: options.verify_crc,
    };
    let mut base_file = decode_with(base, &decode_options).map_err(|err| MergeError::Decode {
        role: Role::Base,
        source: err,
    })?;
    let source_file = decode_with(source, &decode_options).map_err(|err| MergeError::Decode {
        role: Role::Source,
        source: err,
    })?;

    if options.alignment == Alignment::Strict {
        check_alignment(&base_file, &source_file)?;
    }

    let index = build_source_index(source_file.samples());
    drop(source_file);
    if index.is_empty() {
        warn!("source file has no timestamped samples; base passes through unchanged");
    }
    debug!(entries = index.len(), "source index built");

    let stats = apply(&mut base_file, &index, options);
    debug!(
        base_samples = stats.base_samples,
        matched = stats.matched,
        "merge applied"
    );
    let bytes = encode(&base_file)?;
    Ok(MergeOutcome { bytes, stats })
}
