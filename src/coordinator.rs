//! The coordinator: task dispatch, commit handling, and lease reaping for
//! one batch job.
//!
//! All scheduling state lives in a [`Registry`] behind a single mutex.
//! RPC handlers take the lock only for the short atomic portion of their
//! work; file promotion happens outside it. The coordinator is
//! authoritative: a worker whose lease expired simply has its report
//! discarded, it is never told it lost the race.

use crate::proto::coordinator_server::{Coordinator, CoordinatorServer};
use crate::proto::{
    Assignment, CommitReply, CommitRequest, DoneReply, DoneRequest, TaskReply, TaskRequest,
};
use crate::registry::{HolderId, Phase, Registry, TaskId, TaskInput, TaskKind};
use crate::{proto, utils};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{debug, error, info, warn};

/// How long a worker may sit on a task before the reaper takes it back.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// How often the reaper scans for overdue leases.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// How long the server lingers after the job completes, so workers polling
/// at their usual interval still receive `all_done` instead of a dead
/// socket.
const SHUTDOWN_LINGER: Duration = Duration::from_secs(2);

/// The gRPC service backing one job. Cloning shares the underlying
/// registry.
#[derive(Clone)]
pub struct CoordinatorService {
    registry: Arc<Mutex<Registry>>,
    scratch_dir: PathBuf,
    output_dir: PathBuf,
}

impl CoordinatorService {
    /// Set up the job: clear stale intermediate files from a prior run out
    /// of the scratch area, then register one map task per input.
    pub fn new(
        inputs: Vec<PathBuf>,
        n_reduce: u32,
        lease_ttl: Duration,
        scratch_dir: PathBuf,
        output_dir: PathBuf,
    ) -> Result<Self> {
        clear_stale_shards(&scratch_dir)?;

        let mut registry = Registry::new(n_reduce, lease_ttl);
        registry.create_maps(&inputs);
        info!(
            maps = inputs.len(),
            reduces = n_reduce,
            "job registered"
        );

        Ok(Self {
            registry: Arc::new(Mutex::new(registry)),
            scratch_dir,
            output_dir,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether every task of the job has been committed.
    pub fn done(&self) -> bool {
        self.lock().phase() == Phase::Done
    }

    /// The dispatch algorithm: hand out a Ready task in the current phase,
    /// advancing the phase (at most to Done) when the current task set is
    /// complete but nothing is Ready.
    fn next_assignment(&self) -> (Option<Assignment>, u32, bool) {
        let mut registry = self.lock();
        let now = Instant::now();
        let n_reduce = registry.n_reduce();
        loop {
            let Some(kind) = registry.phase().kind() else {
                return (None, n_reduce, true);
            };
            if let Some(task) = registry.try_acquire(kind, now) {
                let lease = task.lease().expect("freshly acquired task is running");
                info!(id = task.id, ?kind, holder = lease.holder, "assigned task");
                let input = match &task.input {
                    TaskInput::File(path) => path.to_string_lossy().into_owned(),
                    TaskInput::Shard(_) => String::new(),
                };
                let assignment = Assignment {
                    id: task.id,
                    kind: match kind {
                        TaskKind::Map => proto::TaskKind::Map as i32,
                        TaskKind::Reduce => proto::TaskKind::Reduce as i32,
                    },
                    input,
                    holder: lease.holder,
                };
                return (Some(assignment), n_reduce, false);
            }
            if !registry.all_finished(kind) {
                // Everything is leased out but not yet committed; the
                // worker polls again.
                let outstanding = registry
                    .snapshot(kind)
                    .iter()
                    .filter(|t| t.lease().is_some())
                    .count();
                debug!(?kind, outstanding, "no ready task; leases still open");
                return (None, n_reduce, false);
            }
            let phase = registry.maybe_advance();
            info!(?phase, "phase advanced");
            if phase == Phase::Done {
                return (None, n_reduce, true);
            }
        }
    }

    /// The two-step commit: validate the lease under the lock, then promote
    /// the staged files outside it. Expiry runs first so an overdue holder
    /// cannot slip a commit in ahead of the reaper.
    fn commit(&self, kind: TaskKind, holder: HolderId, files: &[String]) -> Result<(), Status> {
        if holder == 0 {
            return Err(Status::invalid_argument("commit carries no holder id"));
        }
        if kind == TaskKind::Reduce && files.len() != 1 {
            return Err(Status::invalid_argument(
                "reduce commit must stage exactly one file",
            ));
        }

        let completed = {
            let mut registry = self.lock();
            let now = Instant::now();
            for (kind, id) in registry.expire_overdue(now) {
                warn!(?kind, id, "lease expired; task returned to ready");
            }
            registry.try_complete(kind, holder, now)
        };

        let Some(task_id) = completed else {
            debug!(?kind, holder, "discarding late or duplicate commit");
            return Ok(());
        };
        info!(?kind, id = task_id, holder, "task committed");

        if let Err(err) = self.promote(kind, task_id, files) {
            // Losing committed output is not recoverable within the job.
            error!(?err, ?kind, id = task_id, "failed to publish output");
            std::process::exit(1);
        }
        Ok(())
    }

    /// Move staged files into the committed output namespace. Map shards
    /// keep their `mr-<holder>-<y>` basename; reduce output is named from
    /// the task record, never from the worker-supplied path.
    fn promote(&self, kind: TaskKind, task_id: TaskId, files: &[String]) -> Result<()> {
        for staged in files {
            let src = Path::new(staged);
            let basename = match kind {
                TaskKind::Map => src
                    .file_name()
                    .with_context(|| format!("staged path `{staged}` has no basename"))?
                    .to_owned(),
                TaskKind::Reduce => utils::output_basename(task_id).into(),
            };
            let dest = self.output_dir.join(basename);
            utils::rename_or_copy(src, &dest)
                .with_context(|| format!("promoting `{staged}` to `{}`", dest.display()))?;
        }
        Ok(())
    }

    /// Delete committed intermediate shards once the job is done, leaving
    /// only the `mr-out-*` files in the output directory.
    fn remove_committed_shards(&self) {
        let pattern = self.output_dir.join("mr-*").to_string_lossy().into_owned();
        let Ok(paths) = glob::glob(&pattern) else {
            return;
        };
        for path in paths.flatten() {
            let is_shard = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(utils::parse_shard_basename)
                .is_some();
            if is_shard {
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Serve the job on a Unix-domain socket until every task is
    /// committed, then linger briefly and clean up.
    pub async fn serve(self, socket_path: PathBuf) -> Result<()> {
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        // A crashed prior coordinator leaves its socket file behind.
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        info!(socket = %socket_path.display(), "coordinator listening");

        let reaper = tokio::spawn(reap_loop(self.registry.clone()));

        let registry = self.registry.clone();
        let shutdown = async move {
            loop {
                let phase = registry.lock().unwrap_or_else(|e| e.into_inner()).phase();
                if phase == Phase::Done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            info!("job done; draining worker polls before shutdown");
            tokio::time::sleep(SHUTDOWN_LINGER).await;
        };

        let cleanup = self.clone();
        Server::builder()
            .add_service(CoordinatorServer::new(self))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
            .await?;

        reaper.abort();
        cleanup.remove_committed_shards();
        let _ = fs::remove_file(&socket_path);
        info!("coordinator shut down");
        Ok(())
    }
}

#[tonic::async_trait]
impl Coordinator for CoordinatorService {
    async fn request_task(
        &self,
        _request: Request<TaskRequest>,
    ) -> Result<Response<TaskReply>, Status> {
        let (task, n_reduce, all_done) = self.next_assignment();
        Ok(Response::new(TaskReply {
            task,
            n_reduce,
            all_done,
        }))
    }

    async fn map_done(
        &self,
        request: Request<CommitRequest>,
    ) -> Result<Response<CommitReply>, Status> {
        let req = request.into_inner();
        self.commit(TaskKind::Map, req.holder, &req.files)?;
        Ok(Response::new(CommitReply {}))
    }

    async fn reduce_done(
        &self,
        request: Request<CommitRequest>,
    ) -> Result<Response<CommitReply>, Status> {
        let req = request.into_inner();
        self.commit(TaskKind::Reduce, req.holder, &req.files)?;
        Ok(Response::new(CommitReply {}))
    }

    async fn job_done(
        &self,
        _request: Request<DoneRequest>,
    ) -> Result<Response<DoneReply>, Status> {
        Ok(Response::new(DoneReply { done: self.done() }))
    }
}

/// Background expiry of overdue leases. This is the only mechanism by
/// which a crashed or straggling worker's task gets back into rotation.
async fn reap_loop(registry: Arc<Mutex<Registry>>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        let (reclaimed, phase) = {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            (registry.expire_overdue(Instant::now()), registry.phase())
        };
        for (kind, id) in reclaimed {
            warn!(?kind, id, "lease expired; task returned to ready");
        }
        if phase == Phase::Done {
            break;
        }
    }
}

/// Remove `mr-*` leftovers in the scratch area so shards from a previous
/// job cannot leak into this one.
fn clear_stale_shards(scratch_dir: &Path) -> Result<()> {
    fs::create_dir_all(scratch_dir)?;
    let pattern = scratch_dir.join("mr-*").to_string_lossy().into_owned();
    for path in glob::glob(&pattern)?.flatten() {
        let _ = fs::remove_file(&path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::TaskKind as ProtoKind;
    use std::io::Write;

    fn service(inputs: &[&str], n_reduce: u32, ttl: Duration) -> (CoordinatorService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let output = dir.path().join("out");
        fs::create_dir_all(&output).unwrap();
        let inputs = inputs.iter().map(PathBuf::from).collect();
        let svc = CoordinatorService::new(inputs, n_reduce, ttl, scratch, output).unwrap();
        (svc, dir)
    }

    async fn ask(svc: &CoordinatorService) -> TaskReply {
        svc.request_task(Request::new(TaskRequest {}))
            .await
            .unwrap()
            .into_inner()
    }

    fn stage(dir: &Path, name: &str, contents: &[u8]) -> String {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn dispatch_hands_out_each_map_task_once() {
        let (svc, _dir) = service(&["a.txt", "b.txt", "c.txt"], 2, DEFAULT_LEASE_TTL);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let reply = ask(&svc).await;
            let task = reply.task.unwrap();
            assert_eq!(task.kind, ProtoKind::Map as i32);
            assert_eq!(reply.n_reduce, 2);
            ids.push(task.id);
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);

        // Ten extra callers while the three leases are live: nobody gets a
        // task, nobody is told the job is done.
        for _ in 0..10 {
            let reply = ask(&svc).await;
            assert!(reply.task.is_none());
            assert!(!reply.all_done);
        }
    }

    #[tokio::test]
    async fn concurrent_dispatch_assigns_each_task_exactly_once() {
        let (svc, _dir) = service(&["a.txt", "b.txt", "c.txt"], 1, DEFAULT_LEASE_TTL);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move { ask(&svc).await }));
        }

        let mut ids = Vec::new();
        let mut empty_handed = 0;
        for handle in handles {
            match handle.await.unwrap().task {
                Some(task) => ids.push(task.id),
                None => empty_handed += 1,
            }
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(empty_handed, 7);
    }

    #[tokio::test]
    async fn no_reduce_task_until_every_map_commits() {
        let (svc, dir) = service(&["a.txt", "b.txt"], 1, DEFAULT_LEASE_TTL);

        let first = ask(&svc).await.task.unwrap();
        let second = ask(&svc).await.task.unwrap();

        let staged = stage(&dir.path().join("scratch"), "mr-1-0", b"");
        svc.commit(TaskKind::Map, first.holder, &[staged]).unwrap();

        // One map is still open: the phase gate holds.
        let reply = ask(&svc).await;
        assert!(reply.task.is_none());
        assert!(!reply.all_done);

        let staged = stage(&dir.path().join("scratch"), "mr-2-0", b"");
        svc.commit(TaskKind::Map, second.holder, &[staged]).unwrap();

        // The first request after the last map commit flips the phase and
        // returns a reduce task in the same call.
        let task = ask(&svc).await.task.unwrap();
        assert_eq!(task.kind, ProtoKind::Reduce as i32);
        assert_eq!(task.id, 0);
        assert!(task.input.is_empty());
    }

    #[tokio::test]
    async fn map_promotion_preserves_shard_basenames() {
        let (svc, dir) = service(&["a.txt"], 2, DEFAULT_LEASE_TTL);
        let task = ask(&svc).await.task.unwrap();

        let scratch = dir.path().join("scratch");
        let files = vec![
            stage(&scratch, "mr-1-0", b"zero"),
            stage(&scratch, "mr-1-1", b"one"),
        ];
        svc.commit(TaskKind::Map, task.holder, &files).unwrap();

        let out = dir.path().join("out");
        assert_eq!(fs::read(out.join("mr-1-0")).unwrap(), b"zero");
        assert_eq!(fs::read(out.join("mr-1-1")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn reduce_output_name_comes_from_the_task_not_the_path() {
        let (svc, dir) = service(&[], 1, DEFAULT_LEASE_TTL);
        let task = ask(&svc).await.task.unwrap();
        assert_eq!(task.kind, ProtoKind::Reduce as i32);

        // Worker stages under an arbitrary temp name; the committed file is
        // still mr-out-<task id>.
        let staged = stage(&dir.path().join("scratch"), "whatever.tmp", b"cat 2\n");
        svc.commit(TaskKind::Reduce, task.holder, &[staged]).unwrap();

        let committed = dir.path().join("out").join("mr-out-0");
        assert_eq!(fs::read(committed).unwrap(), b"cat 2\n");
    }

    #[tokio::test]
    async fn late_commit_is_discarded_and_retry_wins() {
        let ttl = Duration::from_millis(20);
        let (svc, dir) = service(&["a.txt"], 1, ttl);

        let stale = ask(&svc).await.task.unwrap();
        tokio::time::sleep(ttl * 2).await;

        // The straggler reports after its lease lapsed: silently dropped,
        // nothing promoted.
        let staged = stage(&dir.path().join("scratch"), "mr-1-0", b"stale");
        svc.commit(TaskKind::Map, stale.holder, &[staged]).unwrap();
        assert!(!dir.path().join("out").join("mr-1-0").exists());

        // Commit itself expired the lease, so the task is re-dispatchable.
        let retry = ask(&svc).await.task.unwrap();
        assert_eq!(retry.id, stale.id);
        assert_ne!(retry.holder, stale.holder);

        let staged = stage(&dir.path().join("scratch"), "mr-2-0", b"fresh");
        svc.commit(TaskKind::Map, retry.holder, &[staged]).unwrap();
        assert_eq!(
            fs::read(dir.path().join("out").join("mr-2-0")).unwrap(),
            b"fresh"
        );
    }

    #[tokio::test]
    async fn replayed_commit_after_success_changes_nothing() {
        let (svc, dir) = service(&[], 1, DEFAULT_LEASE_TTL);
        let task = ask(&svc).await.task.unwrap();

        let staged = stage(&dir.path().join("scratch"), "stage-a", b"first");
        svc.commit(TaskKind::Reduce, task.holder, &[staged]).unwrap();

        let replay = stage(&dir.path().join("scratch"), "stage-b", b"replayed");
        svc.commit(TaskKind::Reduce, task.holder, &[replay]).unwrap();

        let committed = dir.path().join("out").join("mr-out-0");
        assert_eq!(fs::read(committed).unwrap(), b"first");
    }

    #[tokio::test]
    async fn empty_input_job_goes_straight_to_reduce_and_done() {
        let (svc, dir) = service(&[], 2, DEFAULT_LEASE_TTL);

        for expected in 0..2u32 {
            let task = ask(&svc).await.task.unwrap();
            assert_eq!(task.kind, ProtoKind::Reduce as i32);
            assert_eq!(task.id, expected);
            let staged = stage(&dir.path().join("scratch"), "empty", b"");
            svc.commit(TaskKind::Reduce, task.holder, &[staged]).unwrap();
        }

        let reply = ask(&svc).await;
        assert!(reply.all_done);
        assert!(svc.done());
        let queried = svc
            .job_done(Request::new(DoneRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(queried.done);
        assert!(dir.path().join("out").join("mr-out-0").exists());
        assert!(dir.path().join("out").join("mr-out-1").exists());
    }

    #[tokio::test]
    async fn malformed_commits_are_rejected_without_state_change() {
        let (svc, dir) = service(&[], 1, DEFAULT_LEASE_TTL);
        let task = ask(&svc).await.task.unwrap();

        let err = svc.commit(TaskKind::Reduce, 0, &[]).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err = svc
            .commit(TaskKind::Reduce, task.holder, &[])
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        // The lease survived both rejections.
        let staged = stage(&dir.path().join("scratch"), "ok", b"done");
        svc.commit(TaskKind::Reduce, task.holder, &[staged]).unwrap();
        assert!(ask(&svc).await.all_done);
    }

    #[test]
    fn startup_clears_stale_scratch_shards() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        stage(&scratch, "mr-9-0", b"stale");
        stage(&scratch, "keep.txt", b"unrelated");

        let output = dir.path().join("out");
        fs::create_dir_all(&output).unwrap();
        let _svc = CoordinatorService::new(
            vec![PathBuf::from("a.txt")],
            1,
            DEFAULT_LEASE_TTL,
            scratch.clone(),
            output,
        )
        .unwrap();

        assert!(!scratch.join("mr-9-0").exists());
        assert!(scratch.join("keep.txt").exists());
    }
}
