//! Result-stream framing.
//!
//! The worker streams its output back to the launcher as discrete frames
//! over the bounded queue. Four frame kinds exist:
//!
//! | tag | frame | contents |
//! |-----|-------|----------|
//! | `S` | schema | field count, then per field: type tag + name |
//! | `D` | data | field count, then per field: i32 length (-1 = null) + bytes |
//! | `C` | completion | opaque status tag |
//! | `E` | error | message / detail / hint / context, each independently nullable |
//!
//! All integers are little-endian. A data frame's field count must match
//! the schema that preceded it; the session layer enforces that pairing
//! because the codec itself is stateless.

use std::fmt;

use crate::error::ProtocolError;

const TAG_SCHEMA: u8 = b'S';
const TAG_DATA: u8 = b'D';
const TAG_COMPLETE: u8 = b'C';
const TAG_ERROR: u8 = b'E';

/// Field type tags carried in schema frames.
///
/// These describe how the raw bytes of a field should be interpreted by
/// the consumer; the transport itself treats every field as opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    /// Single byte, 0 or 1.
    Bool = 1,
    /// Little-endian i64.
    Int64 = 2,
    /// Little-endian f64.
    Float64 = 3,
    /// UTF-8 text.
    Text = 4,
    /// Uninterpreted bytes.
    Bytes = 5,
}

impl TypeTag {
    fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        match b {
            1 => Ok(Self::Bool),
            2 => Ok(Self::Int64),
            3 => Ok(Self::Float64),
            4 => Ok(Self::Text),
            5 => Ok(Self::Bytes),
            other => Err(ProtocolError::UnknownTypeTag(other)),
        }
    }
}

/// One field of a result schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaField {
    /// Field name.
    pub name: String,
    /// How the field's bytes should be interpreted.
    pub type_tag: TypeTag,
}

/// Description of the rows a job produces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    /// Ordered field descriptions.
    pub fields: Vec<SchemaField>,
}

impl Schema {
    /// Single-column schema, the common case for simple jobs.
    #[must_use]
    pub fn single(name: &str, type_tag: TypeTag) -> Self {
        Self {
            fields: vec![SchemaField {
                name: name.to_owned(),
                type_tag,
            }],
        }
    }
}

/// One row of job output. Each field is either null or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    /// Field values in schema order; `None` is SQL-style null.
    pub fields: Vec<Option<Vec<u8>>>,
}

impl Row {
    /// Build a single-column row from an i64.
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        Self {
            fields: vec![Some(v.to_le_bytes().to_vec())],
        }
    }

    /// Build a single-column row from text.
    #[must_use]
    pub fn from_text(v: &str) -> Self {
        Self {
            fields: vec![Some(v.as_bytes().to_vec())],
        }
    }

    /// Raw bytes of field `i`, or `None` if null or out of range.
    #[must_use]
    pub fn bytes(&self, i: usize) -> Option<&[u8]> {
        self.fields.get(i).and_then(|f| f.as_deref())
    }

    /// Field `i` decoded as little-endian i64.
    #[must_use]
    pub fn i64_field(&self, i: usize) -> Option<i64> {
        let b = self.bytes(i)?;
        Some(i64::from_le_bytes(b.try_into().ok()?))
    }

    /// Field `i` decoded as UTF-8 text.
    #[must_use]
    pub fn text_field(&self, i: usize) -> Option<&str> {
        std::str::from_utf8(self.bytes(i)?).ok()
    }
}

/// The full error record a failed job transports back to the launcher.
///
/// Every field except `message` is optional, and each travels
/// independently; consumers must not assume any of them is present.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorRecord {
    /// Primary error message.
    pub message: String,
    /// Longer description, if the executor provided one.
    pub detail: Option<String>,
    /// Suggested remedy, if any.
    pub hint: Option<String>,
    /// Where the error occurred, if known.
    pub context: Option<String>,
}

impl ErrorRecord {
    /// Record with only a message.
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " (detail: {detail})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        if let Some(context) = &self.context {
            write!(f, " (context: {context})")?;
        }
        Ok(())
    }
}

/// One frame of the worker → launcher result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Describes the rows that follow.
    Schema(Schema),
    /// One row of output.
    Data(Row),
    /// The job finished; carries an opaque status tag.
    Complete {
        /// Status tag, e.g. `"OK"`.
        tag: String,
    },
    /// The job failed.
    Error(ErrorRecord),
}

impl Frame {
    /// Serialize the frame to its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Self::Schema(schema) => {
                buf.push(TAG_SCHEMA);
                put_u16(&mut buf, schema.fields.len() as u16);
                for field in &schema.fields {
                    buf.push(field.type_tag as u8);
                    put_bytes(&mut buf, field.name.as_bytes());
                }
            }
            Self::Data(row) => {
                buf.push(TAG_DATA);
                put_u16(&mut buf, row.fields.len() as u16);
                for field in &row.fields {
                    match field {
                        Some(bytes) => {
                            put_i32(&mut buf, bytes.len() as i32);
                            buf.extend_from_slice(bytes);
                        }
                        None => put_i32(&mut buf, -1),
                    }
                }
            }
            Self::Complete { tag } => {
                buf.push(TAG_COMPLETE);
                put_bytes(&mut buf, tag.as_bytes());
            }
            Self::Error(record) => {
                buf.push(TAG_ERROR);
                put_opt(&mut buf, Some(&record.message));
                put_opt(&mut buf, record.detail.as_deref());
                put_opt(&mut buf, record.hint.as_deref());
                put_opt(&mut buf, record.context.as_deref());
            }
        }
        buf
    }

    /// Parse a frame from its wire form.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf);
        let frame = match r.u8()? {
            TAG_SCHEMA => {
                let count = r.u16()? as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let type_tag = TypeTag::from_u8(r.u8()?)?;
                    let name = r.string()?;
                    fields.push(SchemaField { name, type_tag });
                }
                Self::Schema(Schema { fields })
            }
            TAG_DATA => {
                let count = r.u16()? as usize;
                // Scratch value and null-flag arrays sized to the field
                // count, assembled into the row and dropped right after.
                let mut values: Vec<Vec<u8>> = Vec::with_capacity(count);
                let mut nulls: Vec<bool> = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = r.i32()?;
                    if len < 0 {
                        values.push(Vec::new());
                        nulls.push(true);
                    } else {
                        values.push(r.take(len as usize)?.to_vec());
                        nulls.push(false);
                    }
                }
                let fields = values
                    .into_iter()
                    .zip(nulls)
                    .map(|(v, null)| if null { None } else { Some(v) })
                    .collect();
                Self::Data(Row { fields })
            }
            TAG_COMPLETE => Self::Complete { tag: r.string()? },
            TAG_ERROR => {
                let message = r.opt_string()?.unwrap_or_default();
                let detail = r.opt_string()?;
                let hint = r.opt_string()?;
                let context = r.opt_string()?;
                Self::Error(ErrorRecord {
                    message,
                    detail,
                    hint,
                    context,
                })
            }
            other => return Err(ProtocolError::UnknownFrame(other)),
        };
        Ok(frame)
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn put_opt(buf: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(s) => {
            put_i32(buf, s.len() as i32);
            buf.extend_from_slice(s.as_bytes());
        }
        None => put_i32(buf, -1),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or(ProtocolError::Truncated)?;
        if end > self.buf.len() {
            return Err(ProtocolError::Truncated);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn opt_string(&mut self) -> Result<Option<String>, ProtocolError> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_frame_survives_the_wire() {
        let schema = Schema {
            fields: vec![
                SchemaField {
                    name: "id".into(),
                    type_tag: TypeTag::Int64,
                },
                SchemaField {
                    name: "note".into(),
                    type_tag: TypeTag::Text,
                },
            ],
        };
        let decoded = Frame::decode(&Frame::Schema(schema.clone()).encode()).unwrap();
        assert_eq!(decoded, Frame::Schema(schema));
    }

    #[test]
    fn null_fields_are_distinct_from_empty_fields() {
        let row = Row {
            fields: vec![Some(vec![]), None, Some(b"x".to_vec())],
        };
        let Frame::Data(decoded) = Frame::decode(&Frame::Data(row).encode()).unwrap() else {
            panic!("wrong frame kind");
        };
        assert_eq!(decoded.bytes(0), Some(&[][..]));
        assert_eq!(decoded.bytes(1), None);
        assert_eq!(decoded.bytes(2), Some(&b"x"[..]));
    }

    #[test]
    fn error_fields_travel_independently() {
        let record = ErrorRecord {
            message: "relation does not exist".into(),
            detail: None,
            hint: Some("check the search path".into()),
            context: None,
        };
        let decoded = Frame::decode(&Frame::Error(record.clone()).encode()).unwrap();
        assert_eq!(decoded, Frame::Error(record));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let mut wire = Frame::Complete { tag: "OK".into() }.encode();
        wire.truncate(wire.len() - 1);
        assert_eq!(Frame::decode(&wire), Err(ProtocolError::Truncated));
        assert_eq!(Frame::decode(&[0x7f]), Err(ProtocolError::UnknownFrame(0x7f)));
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn row_typed_accessors() {
        let row = Row::from_i64(42);
        assert_eq!(row.i64_field(0), Some(42));
        let row = Row::from_text("hello");
        assert_eq!(row.text_field(0), Some("hello"));
        assert_eq!(row.i64_field(0), None); // 5 bytes, not 8
    }
}
