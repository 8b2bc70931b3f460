//! Binary container carrying one or more image payloads plus per-record metadata.
//!
//! Every record is laid out little-endian as:
//!
//! ```text
//! [u32 total_len]
//! [payload bytes, zero padded to a 4-byte boundary]
//! [i16 width][i16 height][i16 srgb_flag][i16 format_code][f32 brightness]
//! [u32 payload_len]
//! ```
//!
//! `total_len` counts everything after itself, so the next record starts at
//! `cursor + 4 + total_len`. The unpadded payload length sits in the last four bytes of the
//! record and anchors the metadata block directly after the padded payload.

use crate::{
    codec::{CodecOpts, MipImage, decode_image},
    foundation::error::{WorkerError, WorkerResult},
};

const LEN_PREFIX: usize = 4;
const META_LEN: usize = 12;
/// Metadata block plus the trailing payload length.
pub const TRAILER_LEN: usize = META_LEN + 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordMeta {
    pub width: i16,
    pub height: i16,
    pub srgb_flag: i16,
    pub format_code: i16,
    pub brightness: f32,
}

/// One record as it sits in the container, payload borrowed from the input buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawRecord<'a> {
    pub meta: RecordMeta,
    pub payload: &'a [u8],
}

/// A decoded record: metadata, raw payload and the materialized image.
#[derive(Clone, Debug)]
pub struct ResourceRecord {
    pub meta: RecordMeta,
    pub payload: Vec<u8>,
    /// Job file identity; only ever set on the first record of a container.
    pub source_path: Option<String>,
    pub image: MipImage,
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Parse one record at `cursor`, returning it and the cursor of the next record.
fn read_record(bytes: &[u8], cursor: usize) -> WorkerResult<(RawRecord<'_>, usize)> {
    let remaining = bytes.len() - cursor;
    if remaining < LEN_PREFIX {
        return Err(WorkerError::decode(format!(
            "truncated length prefix at offset {cursor}"
        )));
    }

    let total = read_u32(bytes, cursor) as usize;
    if total < TRAILER_LEN {
        return Err(WorkerError::decode(format!(
            "record at offset {cursor} declares {total} bytes, below the {TRAILER_LEN}-byte trailer"
        )));
    }
    if total > remaining - LEN_PREFIX {
        return Err(WorkerError::decode(format!(
            "record at offset {cursor} declares {total} bytes but only {} remain",
            remaining - LEN_PREFIX
        )));
    }

    let body = cursor + LEN_PREFIX;
    let end = body + total;
    let payload_len = read_u32(bytes, end - 4) as usize;
    let padded = pad4(payload_len);
    if padded > total - TRAILER_LEN {
        return Err(WorkerError::decode(format!(
            "record at offset {cursor} declares a {payload_len}-byte payload exceeding its {} available bytes",
            total - TRAILER_LEN
        )));
    }

    let meta_at = body + padded;
    let meta = RecordMeta {
        width: read_i16(bytes, meta_at),
        height: read_i16(bytes, meta_at + 2),
        srgb_flag: read_i16(bytes, meta_at + 4),
        format_code: read_i16(bytes, meta_at + 6),
        brightness: read_f32(bytes, meta_at + 8),
    };

    Ok((
        RawRecord {
            meta,
            payload: &bytes[body..body + payload_len],
        },
        end,
    ))
}

/// Split a container into its records without touching the payloads.
pub fn decode_records(bytes: &[u8]) -> WorkerResult<Vec<RawRecord<'_>>> {
    let mut out = Vec::new();
    let mut cursor = 0;
    while cursor < bytes.len() {
        let (record, next) = read_record(bytes, cursor)?;
        out.push(record);
        cursor = next;
    }
    if out.is_empty() {
        return Err(WorkerError::decode("container holds no records"));
    }
    Ok(out)
}

/// Decode a container and materialize every payload through the image codec.
pub fn decode(bytes: &[u8], opts: CodecOpts) -> WorkerResult<Vec<ResourceRecord>> {
    decode_records(bytes)?
        .into_iter()
        .enumerate()
        .map(|(i, raw)| {
            let image = decode_image(raw.payload, opts)
                .map_err(|e| WorkerError::decode(format!("record {i}: {e}")))?;
            Ok(ResourceRecord {
                meta: raw.meta,
                payload: raw.payload.to_vec(),
                source_path: None,
                image,
            })
        })
        .collect()
}

/// Append one record to `out` using the container envelope.
pub fn encode_record(out: &mut Vec<u8>, meta: &RecordMeta, payload: &[u8]) {
    let padded = pad4(payload.len());
    let total = (padded + TRAILER_LEN) as u32;

    out.reserve(LEN_PREFIX + total as usize);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(payload);
    out.resize(out.len() + (padded - payload.len()), 0);
    out.extend_from_slice(&meta.width.to_le_bytes());
    out.extend_from_slice(&meta.height.to_le_bytes());
    out.extend_from_slice(&meta.srgb_flag.to_le_bytes());
    out.extend_from_slice(&meta.format_code.to_le_bytes());
    out.extend_from_slice(&meta.brightness.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
}

/// Builder for multi-record containers.
#[derive(Debug, Default)]
pub struct ContainerWriter {
    buf: Vec<u8>,
}

impl ContainerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(mut self, meta: RecordMeta, payload: &[u8]) -> Self {
        encode_record(&mut self.buf, &meta, payload);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
