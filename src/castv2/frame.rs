//! Length-prefixed protobuf `CastMessage` framing.
//!
//! Only string payloads are used, so the message is hand-encoded instead of
//! pulling in a protobuf toolchain: protocol version, source, destination,
//! namespace, payload type and the UTF-8 payload.

const PROTOCOL_VERSION_CASTV2_1_0: u64 = 0;
const PAYLOAD_TYPE_STRING: u64 = 0;
/// Receivers reject frames above 64 KiB.
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024;

const FIELD_PROTOCOL_VERSION: u64 = 1;
const FIELD_SOURCE_ID: u64 = 2;
const FIELD_DESTINATION_ID: u64 = 3;
const FIELD_NAMESPACE: u64 = 4;
const FIELD_PAYLOAD_TYPE: u64 = 5;
const FIELD_PAYLOAD_UTF8: u64 = 6;

const WIRE_VARINT: u64 = 0;
const WIRE_LEN: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CastFrame {
    pub source_id: String,
    pub destination_id: String,
    pub namespace: String,
    pub payload_utf8: String,
}

impl CastFrame {
    pub fn new(
        source_id: impl Into<String>,
        destination_id: impl Into<String>,
        namespace: impl Into<String>,
        payload_utf8: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            destination_id: destination_id.into(),
            namespace: namespace.into(),
            payload_utf8: payload_utf8.into(),
        }
    }

    /// Serializes the message behind its big-endian `u32` length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        let mut body = FieldWriter::default();
        body.uint(FIELD_PROTOCOL_VERSION, PROTOCOL_VERSION_CASTV2_1_0);
        body.string(FIELD_SOURCE_ID, &self.source_id);
        body.string(FIELD_DESTINATION_ID, &self.destination_id);
        body.string(FIELD_NAMESPACE, &self.namespace);
        body.uint(FIELD_PAYLOAD_TYPE, PAYLOAD_TYPE_STRING);
        body.string(FIELD_PAYLOAD_UTF8, &self.payload_utf8);
        let body = body.0;

        if body.len() > MAX_FRAME_LEN {
            return Err(format!("cast frame too large ({} bytes)", body.len()));
        }
        let len = u32::try_from(body.len()).map_err(|_| "cast frame too large".to_string())?;
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Parses the protobuf body of one frame (without the length prefix).
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut frame = Self::new("", "", "", "");
        let mut reader = FieldReader { bytes, cursor: 0 };
        while let Some((field_number, value)) = reader.next_field()? {
            // Binary payloads (field 7) and numeric fields are not used.
            let FieldValue::Bytes(raw) = value else {
                continue;
            };
            let target = match field_number {
                FIELD_SOURCE_ID => &mut frame.source_id,
                FIELD_DESTINATION_ID => &mut frame.destination_id,
                FIELD_NAMESPACE => &mut frame.namespace,
                FIELD_PAYLOAD_UTF8 => &mut frame.payload_utf8,
                _ => continue,
            };
            *target = std::str::from_utf8(raw)
                .map_err(|_| "cast protobuf invalid utf8".to_string())?
                .to_string();
        }
        Ok(frame)
    }
}

#[derive(Default)]
struct FieldWriter(Vec<u8>);

impl FieldWriter {
    fn varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.0.push((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.0.push(value as u8);
    }

    fn uint(&mut self, field_number: u64, value: u64) {
        self.varint(field_number << 3 | WIRE_VARINT);
        self.varint(value);
    }

    fn string(&mut self, field_number: u64, value: &str) {
        self.varint(field_number << 3 | WIRE_LEN);
        self.varint(value.len() as u64);
        self.0.extend_from_slice(value.as_bytes());
    }
}

enum FieldValue<'a> {
    Varint,
    Bytes(&'a [u8]),
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> FieldReader<'a> {
    fn varint(&mut self) -> Option<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.bytes.get(self.cursor)?;
            self.cursor += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }

    fn next_field(&mut self) -> Result<Option<(u64, FieldValue<'a>)>, String> {
        if self.cursor >= self.bytes.len() {
            return Ok(None);
        }
        let key = self
            .varint()
            .ok_or_else(|| "invalid cast protobuf key".to_string())?;
        let value = match key & 0x07 {
            WIRE_VARINT => {
                self.varint()
                    .ok_or_else(|| "invalid cast protobuf varint field".to_string())?;
                FieldValue::Varint
            }
            WIRE_LEN => {
                let len = self
                    .varint()
                    .and_then(|len| usize::try_from(len).ok())
                    .ok_or_else(|| "invalid cast protobuf length".to_string())?;
                let end = self
                    .cursor
                    .checked_add(len)
                    .filter(|end| *end <= self.bytes.len())
                    .ok_or_else(|| "cast protobuf field out of bounds".to_string())?;
                let raw = &self.bytes[self.cursor..end];
                self.cursor = end;
                FieldValue::Bytes(raw)
            }
            other => return Err(format!("unsupported cast protobuf wire type {other}")),
        };
        Ok(Some((key >> 3, value)))
    }
}
