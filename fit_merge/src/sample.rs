//! Typed access to the `record` messages of an activity file.

use serde::{Deserialize, Serialize};

use crate::codec::{ActivityFile, DataMessage, FieldDefinition};
use crate::profile::{
    BASE_UINT16, BASE_UINT8, FIELD_HEART_RATE, FIELD_POWER, MESG_RECORD,
};

const HEART_RATE_FIELD: FieldDefinition = FieldDefinition {
    number: FIELD_HEART_RATE,
    size: 1,
    base_type: BASE_UINT8,
};

const POWER_FIELD: FieldDefinition = FieldDefinition {
    number: FIELD_POWER,
    size: 2,
    base_type: BASE_UINT16,
};

/// One timestamped record. Absent fields are `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Seconds since the FIT epoch.
    pub timestamp: Option<u32>,
    pub heart_rate: Option<u8>,
    pub power: Option<u16>,
}

impl Sample {
    pub fn from_message(message: &DataMessage) -> Self {
        Self {
            timestamp: message.timestamp(),
            heart_rate: message
                .field_value(FIELD_HEART_RATE)
                .and_then(|v| u8::try_from(v).ok()),
            power: message
                .field_value(FIELD_POWER)
                .and_then(|v| u16::try_from(v).ok()),
        }
    }
}

/// Mutable handle on a record message. Writes go straight into the
/// message's field bytes; every other field is left alone.
pub struct SampleMut<'a> {
    message: &'a mut DataMessage,
}

impl SampleMut<'_> {
    pub fn timestamp(&self) -> Option<u32> {
        self.message.timestamp()
    }

    pub fn set_heart_rate(&mut self, heart_rate: u8) -> bool {
        self.message
            .set_field_value(HEART_RATE_FIELD, u64::from(heart_rate))
    }

    pub fn set_power(&mut self, power: u16) -> bool {
        self.message.set_field_value(POWER_FIELD, u64::from(power))
    }
}

impl ActivityFile {
    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.data_messages()
            .filter(|message| message.global() == MESG_RECORD)
            .map(Sample::from_message)
    }

    pub fn samples_mut(&mut self) -> impl Iterator<Item = SampleMut<'_>> {
        self.data_messages_mut()
            .filter(|message| message.global() == MESG_RECORD)
            .map(|message| SampleMut { message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};
    use crate::testutil::{build_fit, SampleSpec};

    #[test]
    fn test_samples_skip_non_record_messages() {
        let bytes = build_fit(&[
            SampleSpec::new(500, Some(101), Some(180)),
            SampleSpec::new(501, None, None),
        ]);
        let file = decode(&bytes).unwrap();
        // The fixture also carries a file_id message.
        assert!(file.data_messages().count() > 2);
        let samples: Vec<_> = file.samples().collect();
        assert_eq!(
            samples,
            vec![
                Sample {
                    timestamp: Some(500),
                    heart_rate: Some(101),
                    power: Some(180),
                },
                Sample {
                    timestamp: Some(501),
                    heart_rate: None,
                    power: None,
                },
            ]
        );
    }

    #[test]
    fn test_sample_mut_writes_fields() {
        let bytes = build_fit(&[SampleSpec::new(500, None, Some(180))]);
        let mut file = decode(&bytes).unwrap();
        for mut sample in file.samples_mut() {
            assert_eq!(sample.timestamp(), Some(500));
            assert!(sample.set_heart_rate(142));
            assert!(sample.set_power(199));
        }
        let reread = decode(&encode(&file).unwrap()).unwrap();
        let sample = reread.samples().next().unwrap();
        assert_eq!(sample.heart_rate, Some(142));
        assert_eq!(sample.power, Some(199));
    }
}
