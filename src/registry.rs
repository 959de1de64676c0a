//! In-memory record of every map and reduce task in the job.
//!
//! The registry is the single coordination point of the engine. Every state
//! transition (`try_acquire`, `try_complete`, `expire_overdue`, phase
//! advancement) is a short, in-memory operation; callers serialize them by
//! keeping the whole registry behind one coordinator-wide mutex. Contention
//! is proportional to worker count, not data volume, so the coarse lock is
//! both sufficient and simpler than per-task locking.

use std::path::PathBuf;
use std::time::{Duration, Instant};

pub type TaskId = u32;

/// Coordinator-minted lease token. Holder ids are globally unique for the
/// lifetime of the job and never recycle, which is what makes late commits
/// from superseded workers detectable.
pub type HolderId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    Map,
    Reduce,
}

/// The kind of task currently being dispatched. Advances monotonically
/// `Map -> Reduce -> Done`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Phase {
    Map,
    Reduce,
    Done,
}

impl Phase {
    /// The task kind dispatched during this phase, if any.
    pub fn kind(self) -> Option<TaskKind> {
        match self {
            Phase::Map => Some(TaskKind::Map),
            Phase::Reduce => Some(TaskKind::Reduce),
            Phase::Done => None,
        }
    }
}

/// Exclusive responsibility for one task, granted to one holder until the
/// deadline passes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Lease {
    pub holder: HolderId,
    pub deadline: Instant,
}

/// A running task carries its lease; the two are inseparable by
/// construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    Ready,
    Running(Lease),
    Finished,
}

/// What a task reads.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TaskInput {
    /// One input file, consumed in full by a single map task.
    File(PathBuf),
    /// The bucket index selecting the intermediate shards `mr-*-<y>`
    /// of one reduce task.
    Shard(u32),
}

#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub input: TaskInput,
    pub state: TaskState,
}

impl Task {
    /// The lease currently attached to this task, if it is running.
    pub fn lease(&self) -> Option<Lease> {
        match self.state {
            TaskState::Running(lease) => Some(lease),
            _ => None,
        }
    }
}

/// The task table for one job, plus the phase marker and the holder-id
/// mint. Both task sets are fixed once created: maps at startup, reduces at
/// the `Map -> Reduce` transition.
pub struct Registry {
    maps: Vec<Task>,
    reduces: Vec<Task>,
    phase: Phase,
    n_reduce: u32,
    next_holder: HolderId,
    lease_ttl: Duration,
}

impl Registry {
    pub fn new(n_reduce: u32, lease_ttl: Duration) -> Self {
        Self {
            maps: Vec::new(),
            reduces: Vec::new(),
            phase: Phase::Map,
            n_reduce,
            next_holder: 0,
            lease_ttl,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn n_reduce(&self) -> u32 {
        self.n_reduce
    }

    /// Create one map task per input file, in input order. Idempotent: a
    /// second call within the map phase is a no-op.
    pub fn create_maps(&mut self, inputs: &[PathBuf]) {
        if !self.maps.is_empty() {
            return;
        }
        self.maps = inputs
            .iter()
            .enumerate()
            .map(|(id, path)| Task {
                id: id as TaskId,
                kind: TaskKind::Map,
                input: TaskInput::File(path.clone()),
                state: TaskState::Ready,
            })
            .collect();
    }

    /// Create the `n_reduce` reduce tasks. Idempotent.
    fn create_reduces(&mut self) {
        if !self.reduces.is_empty() {
            return;
        }
        self.reduces = (0..self.n_reduce)
            .map(|y| Task {
                id: y as TaskId,
                kind: TaskKind::Reduce,
                input: TaskInput::Shard(y),
                state: TaskState::Ready,
            })
            .collect();
    }

    fn tasks(&self, kind: TaskKind) -> &[Task] {
        match kind {
            TaskKind::Map => &self.maps,
            TaskKind::Reduce => &self.reduces,
        }
    }

    fn tasks_mut(&mut self, kind: TaskKind) -> &mut [Task] {
        match kind {
            TaskKind::Map => &mut self.maps,
            TaskKind::Reduce => &mut self.reduces,
        }
    }

    /// A consistent copy of the task set, for introspection and logging.
    pub fn snapshot(&self, kind: TaskKind) -> Vec<Task> {
        self.tasks(kind).to_vec()
    }

    /// Lease out the lowest-id Ready task of the given kind, minting a
    /// fresh holder id with deadline `now + lease_ttl`. Returns the updated
    /// task, or `None` when nothing is Ready.
    pub fn try_acquire(&mut self, kind: TaskKind, now: Instant) -> Option<Task> {
        let holder = self.next_holder + 1;
        let deadline = now + self.lease_ttl;
        let task = self
            .tasks_mut(kind)
            .iter_mut()
            .find(|t| t.state == TaskState::Ready)?;
        task.state = TaskState::Running(Lease { holder, deadline });
        let leased = task.clone();
        self.next_holder = holder;
        Some(leased)
    }

    /// Transition the task held by `holder` to Finished, provided it is
    /// still Running under an unexpired lease. Returns the completed task's
    /// id, or `None` for an expired lease or a duplicate report, in which
    /// case nothing is mutated.
    pub fn try_complete(&mut self, kind: TaskKind, holder: HolderId, now: Instant) -> Option<TaskId> {
        let task = self.tasks_mut(kind).iter_mut().find(|t| {
            matches!(t.state, TaskState::Running(lease) if lease.holder == holder)
        })?;
        if let TaskState::Running(lease) = task.state {
            if lease.deadline <= now {
                return None;
            }
        }
        task.state = TaskState::Finished;
        Some(task.id)
    }

    /// Return every overdue Running task to Ready, clearing its lease.
    /// Ids of the reclaimed tasks are returned for logging.
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<(TaskKind, TaskId)> {
        let mut reclaimed = Vec::new();
        for kind in [TaskKind::Map, TaskKind::Reduce] {
            for task in self.tasks_mut(kind).iter_mut() {
                if let TaskState::Running(lease) = task.state {
                    if lease.deadline <= now {
                        task.state = TaskState::Ready;
                        reclaimed.push((kind, task.id));
                    }
                }
            }
        }
        reclaimed
    }

    /// Whether every task of the given kind is Finished. Vacuously true for
    /// an empty task set, which is how a zero-input job falls straight
    /// through the map phase.
    pub fn all_finished(&self, kind: TaskKind) -> bool {
        self.tasks(kind).iter().all(|t| t.state == TaskState::Finished)
    }

    /// Advance the phase if the current task set is complete. Executes each
    /// transition at most once; entering the reduce phase materializes the
    /// reduce task set. Returns the (possibly unchanged) phase.
    pub fn maybe_advance(&mut self) -> Phase {
        match self.phase {
            Phase::Map if self.all_finished(TaskKind::Map) => {
                self.create_reduces();
                self.phase = Phase::Reduce;
            }
            Phase::Reduce if self.all_finished(TaskKind::Reduce) => {
                self.phase = Phase::Done;
            }
            _ => {}
        }
        self.phase
    }
}
