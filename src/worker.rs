//! The worker loop: poll the coordinator for a task, run the application
//! map or reduce function, stage output in the scratch area, and report
//! back.
//!
//! Workers are stateless. Everything they know about a task arrives in the
//! assignment, and the only credential they hold is the coordinator-minted
//! holder id. A worker that loses its lease never finds out directly; its
//! report is silently discarded and it simply asks for the next task.

use crate::proto::coordinator_client::CoordinatorClient;
use crate::proto::{CommitRequest, TaskKind, TaskRequest};
use crate::{codec, utils, ihash, KeyValue, Workload};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use itertools::Itertools;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::UnixStream;
use tokio::time::sleep;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{info, warn};

/// Delay between polls when the coordinator has nothing ready yet.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive RPC failures tolerated before the worker gives up; a
/// vanished coordinator usually means the job is over.
const MAX_RPC_FAILURES: u32 = 5;

type BucketIndex = u32;
type Buckets = DashMap<BucketIndex, Vec<KeyValue>>;

/// Open a client channel over the coordinator's Unix-domain socket.
pub async fn connect(socket_path: &Path) -> Result<CoordinatorClient<Channel>> {
    let path = socket_path.to_path_buf();
    // The URI is required by the endpoint builder but never resolved; the
    // connector dials the socket directly.
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
        .with_context(|| format!("connecting to {}", socket_path.display()))?;
    Ok(CoordinatorClient::new(channel))
}

/// One worker process: a workload, its auxiliary arguments, and the
/// directories it stages into and reads shards from.
pub struct Worker {
    client: CoordinatorClient<Channel>,
    workload: Workload,
    aux: Bytes,
    scratch_dir: PathBuf,
    shard_dir: PathBuf,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        client: CoordinatorClient<Channel>,
        workload: Workload,
        aux: Bytes,
        scratch_dir: PathBuf,
        shard_dir: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            workload,
            aux,
            scratch_dir,
            shard_dir,
            poll_interval,
        }
    }

    /// Request and execute tasks until the coordinator reports the job
    /// done. A failing map or reduce abandons the lease and moves on; the
    /// coordinator's reaper recycles the task.
    pub async fn run(&mut self) -> Result<()> {
        let mut rpc_failures = 0u32;
        loop {
            let reply = match self.client.request_task(TaskRequest {}).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    rpc_failures += 1;
                    if rpc_failures >= MAX_RPC_FAILURES {
                        bail!("coordinator unreachable: {status}");
                    }
                    warn!(%status, "task request failed; retrying");
                    sleep(self.poll_interval).await;
                    continue;
                }
            };
            rpc_failures = 0;

            if reply.all_done {
                info!("job complete; worker exiting");
                return Ok(());
            }
            let Some(task) = reply.task else {
                sleep(self.poll_interval).await;
                continue;
            };

            match task.kind() {
                TaskKind::Map => {
                    let input = PathBuf::from(&task.input);
                    match self.run_map(task.holder, &input, reply.n_reduce) {
                        Ok(files) => {
                            self.report(true, task.holder, files).await;
                        }
                        Err(err) => warn!(?err, id = task.id, "map task failed; abandoning lease"),
                    }
                }
                TaskKind::Reduce => match self.run_reduce(task.id) {
                    Ok(staged) => {
                        self.report(false, task.holder, vec![staged]).await;
                    }
                    Err(err) => warn!(?err, id = task.id, "reduce task failed; abandoning lease"),
                },
            }
        }
    }

    async fn report(&mut self, map: bool, holder: u64, files: Vec<String>) {
        let request = CommitRequest { holder, files };
        let result = if map {
            self.client.map_done(request).await.map(|_| ())
        } else {
            self.client.reduce_done(request).await.map(|_| ())
        };
        if let Err(status) = result {
            // The lease will lapse and the task will be redone.
            warn!(%status, holder, "failed to report completion");
        }
    }

    /// Run the map function over one input file and stage all `n_reduce`
    /// partition shards. Every bucket gets a file, even an empty one, so
    /// the shard set a reduce task sees is not dependent on key skew.
    fn run_map(&self, holder: u64, input: &Path, n_reduce: u32) -> Result<Vec<String>> {
        let contents = fs::read(input)
            .with_context(|| format!("reading map input {}", input.display()))?;
        let input_kv = KeyValue {
            key: Bytes::from(input.to_string_lossy().into_owned()),
            value: Bytes::from(contents),
        };

        let buckets: Buckets = Buckets::new();
        let map_fn = self.workload.map_fn;
        for item in map_fn(input_kv, self.aux.clone())? {
            let kv = item?;
            let bucket_no = ihash(&kv.key) % n_reduce;
            buckets.entry(bucket_no).or_default().push(kv);
        }

        let mut staged = Vec::with_capacity(n_reduce as usize);
        for y in 0..n_reduce {
            let records = buckets.remove(&y).map(|(_, v)| v).unwrap_or_default();
            let path = self.stage(&utils::shard_basename(holder, y), |file| {
                codec::write_records(file, &records)
            })?;
            staged.push(path);
        }
        Ok(staged)
    }

    /// Gather every committed shard for bucket `y`, sort and group the
    /// records, run the reduce function per key, and stage the output file.
    fn run_reduce(&self, y: u32) -> Result<String> {
        let mut records = Vec::new();
        for shard in self.committed_shards(y)? {
            let mut file = fs::File::open(&shard)
                .with_context(|| format!("opening shard {}", shard.display()))?;
            records.extend(codec::read_records(&mut file)?);
        }
        // Stable sort: records for equal keys keep their shard order.
        records.sort_by(|a, b| a.key.cmp(&b.key));

        let reduce_fn = self.workload.reduce_fn;
        let aux = self.aux.clone();
        self.stage(&utils::output_basename(y), |file| {
            for (key, group) in &records.into_iter().chunk_by(KeyValue::key) {
                let values = Box::new(group.map(KeyValue::into_value));
                let reduced = reduce_fn(key.clone(), values, aux.clone())?;
                let key = utils::string_from_bytes(key)?;
                let value = utils::string_from_bytes(reduced)?;
                writeln!(file, "{key} {value}")?;
            }
            Ok(())
        })
    }

    /// The shards for bucket `y` present in the committed namespace.
    /// Basenames are parsed rather than pattern-matched so `mr-out-*`
    /// files are never mistaken for intermediate data.
    fn committed_shards(&self, y: u32) -> Result<Vec<PathBuf>> {
        let pattern = self
            .shard_dir
            .join(format!("mr-*-{y}"))
            .to_string_lossy()
            .into_owned();
        let mut shards: Vec<PathBuf> = glob::glob(&pattern)?
            .flatten()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(utils::parse_shard_basename)
                    .is_some_and(|(_, bucket)| bucket == y)
            })
            .collect();
        shards.sort();
        Ok(shards)
    }

    /// Write output through a temp file in the scratch directory, then
    /// rename it to its final staged name. A partially written file is
    /// never observable under the staged name.
    fn stage<F>(&self, basename: &str, write: F) -> Result<String>
    where
        F: FnOnce(&mut NamedTempFile) -> Result<()>,
    {
        fs::create_dir_all(&self.scratch_dir)?;
        let mut tmp = NamedTempFile::new_in(&self.scratch_dir)?;
        write(&mut tmp)?;
        let dest = self.scratch_dir.join(basename);
        tmp.persist(&dest)
            .map_err(|e| e.error)
            .with_context(|| format!("staging {}", dest.display()))?;
        Ok(dest.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload;

    // A worker with no live coordinator; the RPC half is exercised by the
    // socket-level tests in tests/.
    fn offline_worker(scratch: &Path, shards: &Path) -> Worker {
        let _guard = tokio::runtime::Runtime::new().unwrap();
        let _enter = _guard.enter();
        let channel = Endpoint::from_static("http://[::]:50051").connect_lazy();
        Worker::new(
            CoordinatorClient::new(channel),
            workload::named("wc").unwrap(),
            Bytes::new(),
            scratch.to_path_buf(),
            shards.to_path_buf(),
            DEFAULT_POLL_INTERVAL,
        )
    }

    #[test]
    fn map_stages_one_shard_per_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "cat dog dog").unwrap();
        let worker = offline_worker(&dir.path().join("scratch"), dir.path());

        let staged = worker.run_map(7, &input, 3).unwrap();
        assert_eq!(staged.len(), 3);
        for (y, path) in staged.iter().enumerate() {
            assert!(path.ends_with(&utils::shard_basename(7, y as u32)));
            assert!(Path::new(path).exists());
        }

        // Every emitted pair landed in the bucket its key hashes to.
        let mut total = 0;
        for (y, path) in staged.iter().enumerate() {
            let mut file = fs::File::open(path).unwrap();
            for kv in codec::read_records(&mut file).unwrap() {
                assert_eq!(ihash(&kv.key) % 3, y as u32);
                total += 1;
            }
        }
        assert_eq!(total, 3);
    }

    #[test]
    fn reduce_groups_across_shards_and_sorts_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let shards = dir.path().to_path_buf();
        let worker = offline_worker(&dir.path().join("scratch"), &shards);

        // Two map workers (holders 1 and 2) each contributed to bucket 0.
        let write_shard = |name: &str, records: &[KeyValue]| {
            let mut file = fs::File::create(shards.join(name)).unwrap();
            codec::write_records(&mut file, records).unwrap();
        };
        write_shard(
            "mr-1-0",
            &[
                KeyValue::new(Bytes::from_static(b"dog"), Bytes::from_static(b"1")),
                KeyValue::new(Bytes::from_static(b"cat"), Bytes::from_static(b"1")),
            ],
        );
        write_shard(
            "mr-2-0",
            &[KeyValue::new(
                Bytes::from_static(b"dog"),
                Bytes::from_static(b"1"),
            )],
        );
        // Output files and other buckets must not be read.
        fs::write(shards.join("mr-out-0"), b"poison 9\n").unwrap();
        write_shard(
            "mr-1-1",
            &[KeyValue::new(
                Bytes::from_static(b"bird"),
                Bytes::from_static(b"1"),
            )],
        );

        let staged = worker.run_reduce(0).unwrap();
        let contents = fs::read_to_string(&staged).unwrap();
        assert_eq!(contents, "cat 1\ndog 2\n");
    }

    #[test]
    fn reduce_over_no_shards_stages_an_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let worker = offline_worker(&dir.path().join("scratch"), dir.path());

        let staged = worker.run_reduce(4).unwrap();
        assert_eq!(fs::read_to_string(&staged).unwrap(), "");
        assert!(staged.ends_with("mr-out-4"));
    }

    #[test]
    fn map_failure_surfaces_as_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let worker = offline_worker(&dir.path().join("scratch"), dir.path());
        let missing = dir.path().join("nope.txt");
        assert!(worker.run_map(1, &missing, 2).is_err());
    }
}
