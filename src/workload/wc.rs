//! A MapReduce-compatible implementation of word count.
//!
//! Map emits `(word, "1")` per word occurrence; reduce sums the counts.
//! Values are ASCII decimals so the committed `mr-out-*` lines read
//! `<word> <count>`.

use crate::*;
use anyhow::Result;
use bytes::Bytes;

pub fn map(kv: KeyValue, _aux: Bytes) -> MapOutput {
    let text = String::from_utf8(kv.value.as_ref().into())?;
    let words = text
        .split(|c: char| !c.is_alphabetic())
        .filter(|s| !s.is_empty())
        .map(|word| word.to_string())
        .collect::<Vec<_>>();

    let iter = words.into_iter().map(|word| {
        Ok(KeyValue {
            key: Bytes::from(word.into_bytes()),
            value: Bytes::from_static(b"1"),
        })
    });
    Ok(Box::new(iter))
}

pub fn reduce(
    _key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    let mut count: u64 = 0;
    for value in values {
        count += std::str::from_utf8(&value)?.trim().parse::<u64>()?;
    }
    Ok(Bytes::from(count.to_string()))
}
