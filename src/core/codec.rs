//! Purpose: Encode and decode one record as marker-delimited bytes.
//! Exports: `Record`, `encode`, `encode_into`, `decode`, `validate_field(s)`, marker constants.
//! Role: Leaf format layer shared by the store, the streaming writer, and the compiler.
//! Invariants: Field bytes never contain `START_MARK`, `SEP`, or `END_MARK[0]`.
//! Invariants: Encoded form is `START_MARK field (SEP field)* END_MARK`; no escaping.
use bstr::{BStr, BString, ByteSlice};

use crate::core::error::{Error, ErrorKind};

/// Opens a record; the backward scan anchor.
pub const START_MARK: u8 = 0xFF;
/// Separates fields within a record.
pub const SEP: u8 = 0xFD;
/// Closes a record. The trailing newline keeps store files line-browsable.
pub const END_MARK: [u8; 2] = [0xFE, b'\n'];

const RESERVED: [u8; 3] = [START_MARK, SEP, END_MARK[0]];

/// A decoded record: the identifier followed by its payload fields.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Record {
    fields: Vec<BString>,
}

impl Record {
    pub fn new(fields: Vec<BString>) -> Self {
        Self { fields }
    }

    /// First field; empty only for the degenerate zero-field record.
    pub fn id(&self) -> &BStr {
        self.fields
            .first()
            .map(|field| field.as_bstr())
            .unwrap_or_else(|| BStr::new(""))
    }

    pub fn fields(&self) -> &[BString] {
        &self.fields
    }

    /// Every field after the identifier.
    pub fn payload(&self) -> &[BString] {
        self.fields.get(1..).unwrap_or(&[])
    }

    pub fn get(&self, index: usize) -> Option<&BStr> {
        self.fields.get(index).map(|field| field.as_bstr())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Rejects field bytes that would collide with a marker.
///
/// Valid UTF-8 never contains 0xFD..=0xFF, so this only trips on raw byte
/// input such as Latin-1 dumps.
pub fn validate_field(field: &[u8]) -> Result<(), Error> {
    match field.iter().position(|byte| RESERVED.contains(byte)) {
        None => Ok(()),
        Some(pos) => Err(Error::new(ErrorKind::EncodingViolation)
            .with_message(format!(
                "field contains reserved byte 0x{:02X} at position {pos}",
                field[pos]
            ))
            .with_offset(pos as u64)),
    }
}

pub fn validate_fields<F: AsRef<[u8]>>(fields: &[F]) -> Result<(), Error> {
    for (index, field) in fields.iter().enumerate() {
        validate_field(field.as_ref()).map_err(|err| {
            let message = format!("field {index}: {}", err.message().unwrap_or_default());
            err.with_message(message)
        })?;
    }
    Ok(())
}

pub fn encoded_len<F: AsRef<[u8]>>(fields: &[F]) -> usize {
    let body: usize = fields.iter().map(|field| field.as_ref().len()).sum();
    1 + body + fields.len().saturating_sub(1) + END_MARK.len()
}

pub fn encode<F: AsRef<[u8]>>(fields: &[F]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(encoded_len(fields));
    encode_into(&mut out, fields)?;
    Ok(out)
}

/// Appends one encoded record to `out`. On error `out` is left untouched.
pub fn encode_into<F: AsRef<[u8]>>(out: &mut Vec<u8>, fields: &[F]) -> Result<(), Error> {
    validate_fields(fields)?;
    out.reserve(encoded_len(fields));
    out.push(START_MARK);
    for (index, field) in fields.iter().enumerate() {
        if index > 0 {
            out.push(SEP);
        }
        out.extend_from_slice(field.as_ref());
    }
    out.extend_from_slice(&END_MARK);
    Ok(())
}

/// Splits a record body (markers already stripped) into fields.
pub fn decode(body: &[u8]) -> Record {
    Record::new(body.split_str(&[SEP]).map(BString::from).collect())
}

/// Identifier of a record body without decoding the rest.
pub fn decode_id(body: &[u8]) -> &[u8] {
    match body.find_byte(SEP) {
        Some(pos) => &body[..pos],
        None => body,
    }
}
