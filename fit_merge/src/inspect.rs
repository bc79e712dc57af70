//! Per-file summaries decoded through `fitparser`, independent of our own
//! codec.

use chrono::{DateTime, Utc};
use fitparser::de::from_bytes;
use fitparser::profile::MesgNum;
use fitparser::Value as FitValue;
use serde::{Deserialize, Serialize};

use crate::MergeError;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    pub records: usize,
    pub first_time: Option<DateTime<Utc>>,
    pub last_time: Option<DateTime<Utc>>,
    pub timespan_s: Option<i64>,
    pub heart_rate_samples: usize,
    pub heart_rate_min: Option<u64>,
    pub heart_rate_max: Option<u64>,
    pub power_samples: usize,
}

pub fn inspect(bytes: &[u8]) -> Result<Inspection, MergeError> {
    let messages = from_bytes(bytes).map_err(|e| MergeError::Inspect(e.to_string()))?;
    let mut summary = Inspection::default();

    for message in messages {
        if message.kind() != MesgNum::Record {
            continue;
        }
        summary.records += 1;
        for field in message.fields() {
            match field.name() {
                "timestamp" => {
                    if let FitValue::Timestamp(ts) = field.value() {
                        let utc = ts.with_timezone(&Utc);
                        summary.first_time.get_or_insert(utc);
                        summary.last_time = Some(utc);
                    }
                }
                "heart_rate" => {
                    if let Some(bpm) = fit_value_to_u64(field.value()) {
                        summary.heart_rate_samples += 1;
                        summary.heart_rate_min =
                            Some(summary.heart_rate_min.map_or(bpm, |m| m.min(bpm)));
                        summary.heart_rate_max =
                            Some(summary.heart_rate_max.map_or(bpm, |m| m.max(bpm)));
                    }
                }
                "power" => {
                    if fit_value_to_u64(field.value()).is_some() {
                        summary.power_samples += 1;
                    }
                }
                _ => {}
            }
        }
    }

    if let (Some(start), Some(end)) = (summary.first_time, summary.last_time) {
        summary.timespan_s = Some((end - start).num_seconds());
    }
    Ok(summary)
}

fn fit_value_to_u64(value: &FitValue) -> Option<u64> {
    match value {
        FitValue::UInt8(v) | FitValue::UInt8z(v) | FitValue::Byte(v) => Some(u64::from(*v)),
        FitValue::UInt16(v) | FitValue::UInt16z(v) => Some(u64::from(*v)),
        FitValue::UInt32(v) | FitValue::UInt32z(v) => Some(u64::from(*v)),
        FitValue::UInt64(v) | FitValue::UInt64z(v) => Some(*v),
        FitValue::Array(values) => values.iter().find_map(fit_value_to_u64),
        _ => None,
    }
}
