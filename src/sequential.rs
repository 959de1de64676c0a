//! In-process execution of a whole job, with no coordinator and no
//! workers.
//!
//! Useful for debugging a workload and as an oracle for the distributed
//! engine: both paths sort stably by key, group, and write the same
//! `"<key> <value>"` lines, so their outputs can be compared directly.

use crate::{KeyValue, Workload};
use anyhow::{Context, Result};
use bytes::Bytes;
use itertools::Itertools;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Map every input, sort and group the combined intermediate data, reduce
/// each key group, and write a single `mr-out-0` into `output_dir`.
pub fn run(workload: &Workload, aux: Bytes, inputs: &[PathBuf], output_dir: &Path) -> Result<()> {
    let mut intermediate = Vec::new();
    let map_fn = workload.map_fn;
    for input in inputs {
        let contents =
            fs::read(input).with_context(|| format!("reading input {}", input.display()))?;
        let input_kv = KeyValue {
            key: Bytes::from(input.to_string_lossy().into_owned()),
            value: Bytes::from(contents),
        };
        for item in map_fn(input_kv, aux.clone())? {
            intermediate.push(item?);
        }
    }
    intermediate.sort_by(|a, b| a.key.cmp(&b.key));

    fs::create_dir_all(output_dir)?;
    let out_path = output_dir.join("mr-out-0");
    let mut out_file = File::create(&out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;

    let reduce_fn = workload.reduce_fn;
    for (key, group) in &intermediate.into_iter().chunk_by(KeyValue::key) {
        let values = Box::new(group.map(KeyValue::into_value));
        let reduced = reduce_fn(key.clone(), values, aux.clone())?;
        let key = crate::utils::string_from_bytes(key)?;
        let value = crate::utils::string_from_bytes(reduced)?;
        writeln!(out_file, "{key} {value}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    #[test]
    fn word_count_over_two_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "cat dog").unwrap();
        fs::write(&b, "dog dog").unwrap();

        let wc = workload::named("wc").unwrap();
        run(&wc, Bytes::new(), &[a, b], dir.path()).unwrap();

        let out = fs::read_to_string(dir.path().join("mr-out-0")).unwrap();
        assert_eq!(out, "cat 1\ndog 3\n");
    }

    #[test]
    fn no_inputs_yields_an_empty_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let wc = workload::named("wc").unwrap();
        run(&wc, Bytes::new(), &[], dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("mr-out-0")).unwrap(),
            ""
        );
    }
}
