//! FIT container codec.
//!
//! Decoding keeps every message and every field as raw bytes so that an
//! untouched file re-encodes byte for byte. Only the fields a caller mutates
//! change, and definitions are re-emitted where a mutation changed a
//! message's layout.

use std::rc::Rc;

use thiserror::Error;
use tracing::debug;

use crate::profile::{base_type_size, invalid_value, FIELD_TIMESTAMP};

const HEADER_SIZE_NO_CRC: u8 = 12;
const HEADER_SIZE_WITH_CRC: u8 = 14;
const SIGNATURE: &[u8; 4] = b".FIT";
const LOCAL_TYPES: usize = 16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("file too short for a FIT header ({0} bytes)")]
    HeaderTooShort(usize),
    #[error("unsupported FIT header size {0}")]
    UnsupportedHeader(u8),
    #[error("missing .FIT signature")]
    BadSignature,
    #[error("header CRC mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    HeaderCrc { stored: u16, computed: u16 },
    #[error("file CRC mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    FileCrc { stored: u16, computed: u16 },
    #[error("truncated data at byte {offset}")]
    Truncated { offset: usize },
    #[error("data message at byte {offset} uses undefined local message type {local}")]
    UndefinedLocal { local: u8, offset: usize },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("segment data of {0} bytes does not fit the FIT header size field")]
    DataTooLarge(usize),
}

#[derive(Clone, Debug)]
pub struct DecodeOptions {
    pub verify_crc: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self { verify_crc: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDefinition {
    pub number: u8,
    pub size: u8,
    pub base_type: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeveloperFieldDefinition {
    pub number: u8,
    pub size: u8,
    pub developer_index: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Definition {
    pub local: u8,
    pub reserved: u8,
    pub endian: Endian,
    pub global: u16,
    pub fields: Vec<FieldDefinition>,
    /// `Some` whenever the definition header carried the developer-data
    /// flag, even with zero developer fields.
    pub developer_fields: Option<Vec<DeveloperFieldDefinition>>,
}

impl Definition {
    pub fn new(local: u8, global: u16, fields: Vec<FieldDefinition>) -> Self {
        Self {
            local,
            reserved: 0,
            endian: Endian::Little,
            global,
            fields,
            developer_fields: None,
        }
    }

    fn position(&self, number: u8) -> Option<usize> {
        self.fields.iter().position(|field| field.number == number)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataHeader {
    Normal,
    CompressedTimestamp { offset: u8 },
}

#[derive(Clone, Debug)]
pub struct DataMessage {
    pub header: DataHeader,
    pub definition: Rc<Definition>,
    /// Raw bytes of each field, in definition order.
    pub fields: Vec<Vec<u8>>,
    pub developer_fields: Vec<Vec<u8>>,
    timestamp: Option<u32>,
}

impl DataMessage {
    pub fn new(definition: Rc<Definition>, fields: Vec<Vec<u8>>) -> Self {
        let mut message = Self {
            header: DataHeader::Normal,
            definition,
            fields,
            developer_fields: Vec::new(),
            timestamp: None,
        };
        message.timestamp = message.field_value(FIELD_TIMESTAMP).map(|v| v as u32);
        message
    }

    pub fn global(&self) -> u16 {
        self.definition.global
    }

    /// Timestamp of this message, resolved from a compressed-timestamp
    /// header when the message carries no timestamp field.
    pub fn timestamp(&self) -> Option<u32> {
        self.timestamp
    }

    /// First element of an unsigned field, or `None` when the field is not
    /// defined or holds its invalid value.
    pub fn field_value(&self, number: u8) -> Option<u64> {
        let index = self.definition.position(number)?;
        let field = self.definition.fields[index];
        let width = base_type_size(field.base_type);
        let bytes = self.fields.get(index)?;
        if bytes.len() < width {
            return None;
        }
        let value = read_unsigned(&bytes[..width], self.definition.endian);
        if value == invalid_value(field.base_type) {
            None
        } else {
            Some(value)
        }
    }

    /// Write the first element of a field. When the message's definition
    /// lacks the field, `template` is appended to a private copy of it.
    pub fn set_field_value(&mut self, template: FieldDefinition, value: u64) -> bool {
        let endian = self.definition.endian;
        match self.definition.position(template.number) {
            Some(index) => {
                let width = base_type_size(self.definition.fields[index].base_type);
                match self.fields.get_mut(index) {
                    Some(bytes) if bytes.len() >= width => {
                        write_unsigned(&mut bytes[..width], value, endian);
                        true
                    }
                    _ => false,
                }
            }
            None => {
                // The field count is a single byte in the definition message.
                if self.definition.fields.len() >= usize::from(u8::MAX) {
                    return false;
                }
                let mut bytes = vec![0u8; template.size as usize];
                let width = base_type_size(template.base_type);
                if bytes.len() < width {
                    return false;
                }
                write_unsigned(&mut bytes[..width], value, endian);
                Rc::make_mut(&mut self.definition).fields.push(template);
                self.fields.push(bytes);
                true
            }
        }
    }
}

#[derive(Clone, Debug)]
pub enum Message {
    Definition(Rc<Definition>),
    Data(DataMessage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub size: u8,
    pub protocol_version: u8,
    pub profile_version: u16,
    /// Header CRC as stored. Only 14-byte headers carry one; encoding
    /// recomputes it unless the stored value is zero ("not computed").
    pub crc: Option<u16>,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            size: HEADER_SIZE_WITH_CRC,
            protocol_version: 0x20,
            profile_version: 2132,
            crc: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Segment {
    pub header: FileHeader,
    pub messages: Vec<Message>,
}

/// A decoded FIT file: one segment, or several for chained files.
#[derive(Clone, Debug, Default)]
pub struct ActivityFile {
    pub segments: Vec<Segment>,
}

impl ActivityFile {
    pub fn data_messages(&self) -> impl Iterator<Item = &DataMessage> {
        self.segments
            .iter()
            .flat_map(|segment| segment.messages.iter())
            .filter_map(|message| match message {
                Message::Data(data) => Some(data),
                Message::Definition(_) => None,
            })
    }

    pub fn data_messages_mut(&mut self) -> impl Iterator<Item = &mut DataMessage> {
        self.segments
            .iter_mut()
            .flat_map(|segment| segment.messages.iter_mut())
            .filter_map(|message| match message {
                Message::Data(data) => Some(data),
                Message::Definition(_) => None,
            })
    }
}

pub fn decode(bytes: &[u8]) -> Result<ActivityFile, DecodeError> {
    decode_with(bytes, &DecodeOptions::default())
}

pub fn decode_with(bytes: &[u8], options: &DecodeOptions) -> Result<ActivityFile, DecodeError> {
    let mut segments = Vec::new();
    let mut offset = 0;
    loop {
        let (segment, consumed) = decode_segment(&bytes[offset..], offset, options)?;
        debug!(
            offset,
            messages = segment.messages.len(),
            "decoded FIT segment"
        );
        segments.push(segment);
        offset += consumed;
        if offset >= bytes.len() {
            break;
        }
    }
    Ok(ActivityFile { segments })
}

fn decode_segment(
    bytes: &[u8],
    start: usize,
    options: &DecodeOptions,
) -> Result<(Segment, usize), DecodeError> {
    if bytes.len() < HEADER_SIZE_NO_CRC as usize {
        return Err(DecodeError::HeaderTooShort(bytes.len()));
    }
    let size = bytes[0];
    if size != HEADER_SIZE_NO_CRC && size != HEADER_SIZE_WITH_CRC {
        return Err(DecodeError::UnsupportedHeader(size));
    }
    if bytes.len() < size as usize {
        return Err(DecodeError::HeaderTooShort(bytes.len()));
    }
    if &bytes[8..12] != SIGNATURE {
        return Err(DecodeError::BadSignature);
    }

    let crc = if size == HEADER_SIZE_WITH_CRC {
        let stored = u16::from_le_bytes([bytes[12], bytes[13]]);
        let computed = crc16(&bytes[..12]);
        if options.verify_crc && stored != 0 && stored != computed {
            return Err(DecodeError::HeaderCrc { stored, computed });
        }
        Some(stored)
    } else {
        None
    };

    let data_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let data_start = size as usize;
    let data_end = data_start + data_size;
    if data_end + 2 > bytes.len() {
        return Err(DecodeError::Truncated {
            offset: start + bytes.len(),
        });
    }
    if options.verify_crc {
        let stored = u16::from_le_bytes([bytes[data_end], bytes[data_end + 1]]);
        let computed = crc16(&bytes[..data_end]);
        if stored != computed {
            return Err(DecodeError::FileCrc { stored, computed });
        }
    }

    let header = FileHeader {
        size,
        protocol_version: bytes[1],
        profile_version: u16::from_le_bytes([bytes[2], bytes[3]]),
        crc,
    };
    let messages = decode_messages(&bytes[data_start..data_end], start + data_start)?;
    Ok((Segment { header, messages }, data_end + 2))
}

fn decode_messages(data: &[u8], base: usize) -> Result<Vec<Message>, DecodeError> {
    let mut messages = Vec::new();
    let mut local_defs: [Option<Rc<Definition>>; LOCAL_TYPES] = Default::default();
    let mut last_timestamp: Option<u32> = None;
    let mut reader = Reader {
        data,
        pos: 0,
        base,
    };

    while !reader.is_empty() {
        let at = reader.offset();
        let header = reader.byte()?;
        if header & 0x80 != 0 {
            let local = (header >> 5) & 0x03;
            let offset = header & 0x1F;
            let definition = local_defs[local as usize]
                .clone()
                .ok_or(DecodeError::UndefinedLocal { local, offset: at })?;
            let mut message = read_data(&mut reader, definition)?;
            message.header = DataHeader::CompressedTimestamp { offset };
            if message.timestamp.is_none() {
                message.timestamp = last_timestamp.map(|last| resolve_compressed(last, offset));
            }
            if message.timestamp.is_some() {
                last_timestamp = message.timestamp;
            }
            messages.push(Message::Data(message));
        } else if header & 0x40 != 0 {
            let local = header & 0x0F;
            let definition = Rc::new(read_definition(&mut reader, local, header & 0x20 != 0)?);
            local_defs[local as usize] = Some(definition.clone());
            messages.push(Message::Definition(definition));
        } else {
            let local = header & 0x0F;
            let definition = local_defs[local as usize]
                .clone()
                .ok_or(DecodeError::UndefinedLocal { local, offset: at })?;
            let message = read_data(&mut reader, definition)?;
            if message.timestamp.is_some() {
                last_timestamp = message.timestamp;
            }
            messages.push(Message::Data(message));
        }
    }
    Ok(messages)
}

fn read_definition(
    reader: &mut Reader<'_>,
    local: u8,
    has_developer_data: bool,
) -> Result<Definition, DecodeError> {
    let reserved = reader.byte()?;
    let endian = if reader.byte()? == 0 {
        Endian::Little
    } else {
        Endian::Big
    };
    let global_bytes = reader.take(2)?;
    let global = read_unsigned(global_bytes, endian) as u16;
    let count = reader.byte()?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let raw = reader.take(3)?;
        fields.push(FieldDefinition {
            number: raw[0],
            size: raw[1],
            base_type: raw[2],
        });
    }
    let developer_fields = if has_developer_data {
        let count = reader.byte()?;
        let mut dev = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = reader.take(3)?;
            dev.push(DeveloperFieldDefinition {
                number: raw[0],
                size: raw[1],
                developer_index: raw[2],
            });
        }
        Some(dev)
    } else {
        None
    };
    Ok(Definition {
        local,
        reserved,
        endian,
        global,
        fields,
        developer_fields,
    })
}

fn read_data(
    reader: &mut Reader<'_>,
    definition: Rc<Definition>,
) -> Result<DataMessage, DecodeError> {
    let mut fields = Vec::with_capacity(definition.fields.len());
    for field in &definition.fields {
        fields.push(reader.take(field.size as usize)?.to_vec());
    }
    let mut developer_fields = Vec::new();
    if let Some(dev) = definition.developer_fields.as_ref() {
        for field in dev {
            developer_fields.push(reader.take(field.size as usize)?.to_vec());
        }
    }
    let mut message = DataMessage::new(definition, fields);
    message.developer_fields = developer_fields;
    Ok(message)
}

/// Rebuild a full timestamp from the five-bit offset of a compressed header.
fn resolve_compressed(last: u32, offset: u8) -> u32 {
    let offset = u32::from(offset);
    last.wrapping_add(offset.wrapping_sub(last & 0x1F) & 0x1F)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn offset(&self) -> usize {
        self.base + self.pos
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(DecodeError::Truncated {
                offset: self.base + self.data.len(),
            });
        }
        let data = self.data;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

pub fn encode(file: &ActivityFile) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    for segment in &file.segments {
        encode_segment(&mut out, segment)?;
    }
    Ok(out)
}

fn encode_segment(out: &mut Vec<u8>, segment: &Segment) -> Result<(), EncodeError> {
    let mut data = Vec::new();
    let mut active: [Option<Rc<Definition>>; LOCAL_TYPES] = Default::default();
    let mut injected = 0usize;

    for message in &segment.messages {
        match message {
            Message::Definition(definition) => {
                write_definition(&mut data, definition);
                active[(definition.local & 0x0F) as usize] = Some(definition.clone());
            }
            Message::Data(message) => {
                let slot = &mut active[(message.definition.local & 0x0F) as usize];
                if slot.as_deref() != Some(&*message.definition) {
                    write_definition(&mut data, &message.definition);
                    *slot = Some(message.definition.clone());
                    injected += 1;
                }
                write_data(&mut data, message);
            }
        }
    }
    if injected > 0 {
        debug!(injected, "re-emitted definitions for modified layouts");
    }

    let data_size = u32::try_from(data.len()).map_err(|_| EncodeError::DataTooLarge(data.len()))?;
    let start = out.len();
    let header = &segment.header;
    out.push(header.size);
    out.push(header.protocol_version);
    out.extend_from_slice(&header.profile_version.to_le_bytes());
    out.extend_from_slice(&data_size.to_le_bytes());
    out.extend_from_slice(SIGNATURE);
    if header.size == HEADER_SIZE_WITH_CRC {
        let crc = match header.crc {
            Some(0) => 0,
            _ => crc16(&out[start..]),
        };
        out.extend_from_slice(&crc.to_le_bytes());
    }
    out.extend_from_slice(&data);
    let crc = crc16(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

fn write_definition(out: &mut Vec<u8>, definition: &Definition) {
    let mut header = 0x40 | (definition.local & 0x0F);
    if definition.developer_fields.is_some() {
        header |= 0x20;
    }
    out.push(header);
    out.push(definition.reserved);
    let (architecture, global) = match definition.endian {
        Endian::Little => (0u8, definition.global.to_le_bytes()),
        Endian::Big => (1u8, definition.global.to_be_bytes()),
    };
    out.push(architecture);
    out.extend_from_slice(&global);
    out.push(definition.fields.len() as u8);
    for field in &definition.fields {
        out.extend_from_slice(&[field.number, field.size, field.base_type]);
    }
    if let Some(dev) = definition.developer_fields.as_ref() {
        out.push(dev.len() as u8);
        for field in dev {
            out.extend_from_slice(&[field.number, field.size, field.developer_index]);
        }
    }
}

fn write_data(out: &mut Vec<u8>, message: &DataMessage) {
    let local = message.definition.local;
    match message.header {
        DataHeader::Normal => out.push(local & 0x0F),
        DataHeader::CompressedTimestamp { offset } => {
            out.push(0x80 | ((local & 0x03) << 5) | (offset & 0x1F))
        }
    }
    for bytes in message.fields.iter().chain(message.developer_fields.iter()) {
        out.extend_from_slice(bytes);
    }
}

fn read_unsigned(bytes: &[u8], endian: Endian) -> u64 {
    match endian {
        Endian::Little => bytes
            .iter()
            .rev()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
        Endian::Big => bytes
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)),
    }
}

fn write_unsigned(bytes: &mut [u8], value: u64, endian: Endian) {
    let len = bytes.len();
    for (i, byte) in bytes.iter_mut().enumerate() {
        let shift = match endian {
            Endian::Little => i,
            Endian::Big => len - 1 - i,
        };
        *byte = (value >> (8 * shift)) as u8;
    }
}

/// The FIT 16-bit CRC (CRC-16/ARC computed four bits at a time).
pub fn crc16(data: &[u8]) -> u16 {
    const CRC_TABLE: [u16; 16] = [
        0x0000, 0xCC01, 0xD801, 0x1400, 0xF001, 0x3C00, 0x2800, 0xE401, 0xA001, 0x6C00, 0x7800,
        0xB401, 0x5000, 0x9C01, 0x8801, 0x4400,
    ];

    data.iter().fold(0u16, |crc, byte| {
        let mut tmp = CRC_TABLE[(crc & 0xF) as usize];
        let mut crc = (crc >> 4) & 0x0FFF;
        crc ^= tmp ^ CRC_TABLE[(byte & 0xF) as usize];
        tmp = CRC_TABLE[(crc & 0xF) as usize];
        crc = (crc >> 4) & 0x0FFF;
        crc ^ tmp ^ CRC_TABLE[((byte >> 4) & 0xF) as usize]
    })
}
