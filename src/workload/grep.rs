//! A MapReduce-compatible implementation of `grep`.
//!
//! The search term arrives through the auxiliary arguments, serialized by
//! the worker CLI as a JSON string vector and parsed here with clap. Match
//! values are text, `<line number>\t<line>`, so committed output stays
//! greppable itself.

use crate::*;
use anyhow::{bail, Result};
use bytes::Bytes;
use clap::Parser;

#[derive(Parser, Debug)]
#[clap(no_binary_name = true)]
struct Args {
    /// Substring to search every input line for
    #[clap(short, long, value_parser)]
    term: String,
}

pub fn map(kv: KeyValue, aux: Bytes) -> MapOutput {
    let args = Args::try_parse_from(serde_json::from_slice::<Vec<String>>(&aux)?)?;
    let text = String::from_utf8(kv.value.as_ref().into())?;

    let mut matches = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.contains(&args.term) {
            matches.push(KeyValue {
                key: kv.key.clone(),
                value: Bytes::from(format!("{}\t{}", idx + 1, line)),
            });
        }
    }
    Ok(Box::new(matches.into_iter().map(Ok)))
}

pub fn reduce(
    key: Bytes,
    values: Box<dyn Iterator<Item = Bytes> + '_>,
    _aux: Bytes,
) -> Result<Bytes> {
    let filename = String::from_utf8(key.to_vec())?;

    let mut hits: Vec<(u64, String)> = Vec::new();
    for value in values {
        let text = String::from_utf8(value.to_vec())?;
        // The line itself may contain tabs; only the first one delimits.
        let Some((line_no, line)) = text.split_once('\t') else {
            bail!("malformed grep match `{text}`");
        };
        hits.push((line_no.parse()?, line.to_string()));
    }
    hits.sort_by_key(|(line_no, _)| *line_no);

    let lines: Vec<String> = hits
        .into_iter()
        .map(|(line_no, line)| format!("{filename}:{line_no}:: {line}"))
        .collect();
    Ok(Bytes::from(lines.join("\n")))
}
