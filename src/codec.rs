//! Length-delimited framing for intermediate shard files.
//!
//! Map workers encode each emitted pair as `u32` key length, key bytes,
//! `u32` value length, value bytes; reduce workers decode the same stream.
//! Values are arbitrary binary, so a line-oriented format is not an option
//! here.

use crate::KeyValue;
use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{Read, Write};

/// Append one framed record to `buf`.
pub fn encode_record(buf: &mut BytesMut, kv: &KeyValue) {
    buf.reserve(8 + kv.key.len() + kv.value.len());
    buf.put_u32(kv.key.len() as u32);
    buf.put_slice(&kv.key);
    buf.put_u32(kv.value.len() as u32);
    buf.put_slice(&kv.value);
}

/// Write a whole run of records to `writer` in one frame-packed buffer.
pub fn write_records<'a, W, I>(writer: &mut W, records: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a KeyValue>,
{
    let mut buf = BytesMut::new();
    for kv in records {
        encode_record(&mut buf, kv);
    }
    writer.write_all(&buf)?;
    Ok(())
}

/// Decode every record in `buf`. A short header or a length running past
/// the end of the buffer means the shard was not written through the
/// staging rename and is treated as corrupt.
pub fn decode_all(mut buf: Bytes) -> Result<Vec<KeyValue>> {
    let mut records = Vec::new();
    while buf.has_remaining() {
        records.push(decode_one(&mut buf)?);
    }
    Ok(records)
}

fn decode_one(buf: &mut Bytes) -> Result<KeyValue> {
    let key = take_frame(buf)?;
    let value = take_frame(buf)?;
    Ok(KeyValue { key, value })
}

fn take_frame(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        bail!("truncated shard: frame header cut short");
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        bail!(
            "truncated shard: frame wants {len} bytes, {} remain",
            buf.remaining()
        );
    }
    Ok(buf.split_to(len))
}

/// Read and decode an entire shard stream.
pub fn read_records<R: Read>(reader: &mut R) -> Result<Vec<KeyValue>> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    decode_all(Bytes::from(raw))
}
