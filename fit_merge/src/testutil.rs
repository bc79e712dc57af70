//! In-memory FIT fixtures for tests.

use std::rc::Rc;

use crate::codec::{
    encode, ActivityFile, DataMessage, Definition, FieldDefinition, FileHeader, Message, Segment,
};
use crate::profile::{
    BASE_UINT16, BASE_UINT32, BASE_UINT8, FIELD_HEART_RATE, FIELD_POWER, FIELD_TIMESTAMP,
    MESG_RECORD,
};

const MESG_FILE_ID: u16 = 0;
const FIELD_DISTANCE: u8 = 5;

pub struct SampleSpec {
    timestamp: u32,
    heart_rate: Option<u8>,
    power: Option<u16>,
    has_heart_rate_field: bool,
}

impl SampleSpec {
    pub fn new(timestamp: u32, heart_rate: Option<u8>, power: Option<u16>) -> Self {
        Self {
            timestamp,
            heart_rate,
            power,
            has_heart_rate_field: true,
        }
    }

    /// Encode this sample with a definition that has no heart_rate field.
    pub fn without_heart_rate(mut self) -> Self {
        self.has_heart_rate_field = false;
        self
    }
}

fn field(number: u8, size: u8, base_type: u8) -> FieldDefinition {
    FieldDefinition {
        number,
        size,
        base_type,
    }
}

/// Build a single-segment activity: a file_id message followed by one record
/// per `SampleSpec`. Records also carry a distance field so tests can check that
/// untouched fields survive.
pub fn build_fit(samples: &[SampleSpec]) -> Vec<u8> {
    let file_id = Rc::new(Definition::new(
        0,
        MESG_FILE_ID,
        vec![field(0, 1, 0x00), field(4, 4, BASE_UINT32)],
    ));
    let with_hr = Rc::new(Definition::new(
        1,
        MESG_RECORD,
        vec![
            field(FIELD_TIMESTAMP, 4, BASE_UINT32),
            field(FIELD_HEART_RATE, 1, BASE_UINT8),
            field(FIELD_POWER, 2, BASE_UINT16),
            field(FIELD_DISTANCE, 4, BASE_UINT32),
        ],
    ));
    let without_hr = Rc::new(Definition::new(
        2,
        MESG_RECORD,
        vec![
            field(FIELD_TIMESTAMP, 4, BASE_UINT32),
            field(FIELD_POWER, 2, BASE_UINT16),
            field(FIELD_DISTANCE, 4, BASE_UINT32),
        ],
    ));

    let created = samples.first().map_or(0, |s| s.timestamp);
    let mut messages = vec![
        Message::Definition(file_id.clone()),
        Message::Data(DataMessage::new(
            file_id,
            vec![vec![4], created.to_le_bytes().to_vec()],
        )),
        Message::Definition(with_hr.clone()),
        Message::Definition(without_hr.clone()),
    ];

    for sample in samples {
        let timestamp = sample.timestamp.to_le_bytes().to_vec();
        let power = sample.power.unwrap_or(u16::MAX).to_le_bytes().to_vec();
        let distance = sample.timestamp.wrapping_mul(100).to_le_bytes().to_vec();
        let message = if sample.has_heart_rate_field {
            let heart_rate = vec![sample.heart_rate.unwrap_or(u8::MAX)];
            DataMessage::new(with_hr.clone(), vec![timestamp, heart_rate, power, distance])
        } else {
            DataMessage::new(without_hr.clone(), vec![timestamp, power, distance])
        };
        messages.push(Message::Data(message));
    }

    let file = ActivityFile {
        segments: vec![Segment {
            header: FileHeader::default(),
            messages,
        }],
    };
    encode(&file).expect("fixture fits in a FIT segment")
}

/// A record whose definition already holds the maximum of 255 fields, none
/// of them heart_rate.
pub fn build_wide_record(timestamp: u32) -> Vec<u8> {
    let mut fields = Vec::new();
    let mut values = Vec::new();
    for number in (0..=u8::MAX).filter(|n| *n != FIELD_HEART_RATE) {
        if number == FIELD_TIMESTAMP {
            fields.push(field(number, 4, BASE_UINT32));
            values.push(timestamp.to_le_bytes().to_vec());
        } else {
            fields.push(field(number, 1, BASE_UINT8));
            values.push(vec![u8::MAX]);
        }
    }
    let definition = Rc::new(Definition::new(3, MESG_RECORD, fields));
    let file = ActivityFile {
        segments: vec![Segment {
            header: FileHeader::default(),
            messages: vec![
                Message::Definition(definition.clone()),
                Message::Data(DataMessage::new(definition, values)),
            ],
        }],
    };
    encode(&file).expect("fixture fits in a FIT segment")
}
