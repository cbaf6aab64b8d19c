//! Priority-ordered prefetch queue with bounded concurrency.
//!
//! Pure bookkeeping: the queue decides what may start and when, the client's
//! driver task performs the fetches and reports back through
//! [`PrefetchQueue::complete`].

use std::collections::{HashMap, HashSet};

use docket_config::PrefetchConfig;
use docket_primitives::ids::EntityRef;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    #[must_use]
    pub const fn lowered(self) -> Self {
        match self {
            Self::High => Self::Normal,
            Self::Normal | Self::Low => Self::Low,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrefetchTask {
    pub entity: EntityRef,
    pub priority: Priority,
    /// Zero for the first attempt, one for the single retry.
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Already queued at a lower priority; moved up.
    Promoted,
    AlreadyQueued,
    AlreadyInflight,
    AlreadyFresh,
    /// Failed permanently since the last resynchronization.
    GaveUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextTask {
    Start(PrefetchTask),
    /// Nothing may start before this instant.
    WaitUntil(Instant),
    Idle,
    /// The in-flight budget is used up.
    Saturated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Done,
    RetryScheduled,
    Failed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefetchStats {
    pub started: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Highest number of fetches ever in flight at once.
    pub peak_inflight: usize,
}

#[derive(Clone, Copy, Debug)]
struct Queued {
    task: PrefetchTask,
    seq: u64,
    not_before: Option<Instant>,
}

#[derive(Debug)]
pub struct PrefetchQueue {
    config: PrefetchConfig,
    queued: Vec<Queued>,
    inflight: HashMap<EntityRef, PrefetchTask>,
    gave_up: HashSet<EntityRef>,
    last_start: Option<Instant>,
    next_seq: u64,
    stats: PrefetchStats,
}

impl PrefetchQueue {
    #[must_use]
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            config,
            queued: Vec::new(),
            inflight: HashMap::new(),
            gave_up: HashSet::new(),
            last_start: None,
            next_seq: 0,
            stats: PrefetchStats::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &PrefetchConfig {
        &self.config
    }

    #[must_use]
    pub const fn stats(&self) -> PrefetchStats {
        self.stats
    }

    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    #[must_use]
    pub fn is_queued(&self, entity: &EntityRef) -> bool {
        self.queued.iter().any(|queued| queued.task.entity == *entity)
    }

    #[must_use]
    pub fn is_inflight(&self, entity: &EntityRef) -> bool {
        self.inflight.contains_key(entity)
    }

    /// Queues a fetch of `entity`. `fresh` tells whether the store already
    /// holds a fresh copy, in which case nothing is queued.
    pub fn enqueue(&mut self, entity: EntityRef, priority: Priority, fresh: bool) -> EnqueueOutcome {
        if fresh {
            return EnqueueOutcome::AlreadyFresh;
        }
        if self.inflight.contains_key(&entity) {
            return EnqueueOutcome::AlreadyInflight;
        }
        if self.gave_up.contains(&entity) {
            return EnqueueOutcome::GaveUp;
        }

        if let Some(queued) = self.queued.iter_mut().find(|queued| queued.task.entity == entity) {
            if priority <= queued.task.priority {
                return EnqueueOutcome::AlreadyQueued;
            }
            queued.task.priority = priority;
            debug!(%entity, ?priority, "Promoted queued prefetch");
            return EnqueueOutcome::Promoted;
        }

        let seq = self.bump_seq();
        self.queued.push(Queued {
            task: PrefetchTask {
                entity,
                priority,
                attempt: 0,
            },
            seq,
            not_before: None,
        });
        EnqueueOutcome::Queued
    }

    /// Removes a queued task. In-flight fetches cannot be cancelled.
    pub fn cancel(&mut self, entity: &EntityRef) -> bool {
        let before = self.queued.len();
        self.queued.retain(|queued| queued.task.entity != *entity);
        let cancelled = self.queued.len() != before;
        if cancelled {
            self.stats.cancelled += 1;
        }
        cancelled
    }

    /// Lowers the priority of a queued task whose entity just became up to
    /// date through another path.
    pub fn demote(&mut self, entity: &EntityRef) -> bool {
        let seq = self.bump_seq();
        let Some(queued) = self.queued.iter_mut().find(|queued| queued.task.entity == *entity) else {
            return false;
        };
        queued.task.priority = queued.task.priority.lowered();
        queued.seq = seq;
        true
    }

    /// Forgets permanent failures so a resynchronization may try again.
    pub fn reset_failures(&mut self) {
        self.gave_up.clear();
    }

    /// Picks the next task allowed to start at `now`, marking it in flight.
    pub fn poll_next(&mut self, now: Instant) -> NextTask {
        if self.queued.is_empty() {
            return NextTask::Idle;
        }
        if self.inflight.len() >= self.config.max_concurrent {
            return NextTask::Saturated;
        }

        if let Some(last) = self.last_start {
            let earliest = last + self.config.min_spacing;
            if now < earliest {
                return NextTask::WaitUntil(earliest);
            }
        }

        let best = self
            .queued
            .iter()
            .enumerate()
            .filter(|(_, queued)| queued.not_before.is_none_or(|at| at <= now))
            .max_by(|(_, a), (_, b)| {
                a.task
                    .priority
                    .cmp(&b.task.priority)
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(index, _)| index);

        let Some(index) = best else {
            return self
                .queued
                .iter()
                .filter_map(|queued| queued.not_before)
                .min()
                .map_or(NextTask::Idle, NextTask::WaitUntil);
        };

        let task = self.queued.swap_remove(index).task;
        let _prev = self.inflight.insert(task.entity, task);
        self.last_start = Some(now);
        self.stats.started += 1;
        self.stats.peak_inflight = self.stats.peak_inflight.max(self.inflight.len());

        NextTask::Start(task)
    }

    /// Records the end of an in-flight fetch.
    ///
    /// A first failure is retried once after the retry delay at a lowered
    /// priority; a second failure is permanent.
    pub fn complete(&mut self, entity: &EntityRef, ok: bool, now: Instant) -> Completion {
        let Some(task) = self.inflight.remove(entity) else {
            return Completion::Done;
        };

        if ok {
            self.stats.completed += 1;
            return Completion::Done;
        }

        if task.attempt == 0 {
            self.stats.retried += 1;
            let seq = self.bump_seq();
            self.queued.push(Queued {
                task: PrefetchTask {
                    entity: task.entity,
                    priority: task.priority.lowered(),
                    attempt: 1,
                },
                seq,
                not_before: Some(now + self.config.retry_delay),
            });
            return Completion::RetryScheduled;
        }

        self.stats.failed += 1;
        let _new = self.gave_up.insert(task.entity);
        debug!(%entity, "Prefetch failed permanently");
        Completion::Failed
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use super::*;

    fn queue(max_concurrent: usize) -> PrefetchQueue {
        PrefetchQueue::new(PrefetchConfig {
            max_concurrent,
            min_spacing: Duration::from_millis(50),
            retry_delay: Duration::from_millis(500),
            freshness: Duration::from_secs(30),
        })
    }

    fn started(next: NextTask) -> EntityRef {
        match next {
            NextTask::Start(task) => task.entity,
            other => panic!("expected a start, got {other:?}"),
        }
    }

    #[test]
    fn test_high_priority_is_spliced_ahead() {
        let mut queue = queue(3);
        let now = Instant::now();

        for id in 1..=3 {
            let _outcome = queue.enqueue(EntityRef::ticket(id), Priority::Normal, false);
        }
        assert_eq!(
            queue.enqueue(EntityRef::ticket(9), Priority::High, false),
            EnqueueOutcome::Queued
        );

        assert_eq!(started(queue.poll_next(now)), EntityRef::ticket(9));
        let later = now + Duration::from_millis(50);
        assert_eq!(
            started(queue.poll_next(later)),
            EntityRef::ticket(1),
            "FIFO within a priority"
        );
    }

    #[test]
    fn test_enqueue_deduplicates() {
        let mut queue = queue(3);
        let entity = EntityRef::ticket(1);

        assert_eq!(queue.enqueue(entity, Priority::Low, true), EnqueueOutcome::AlreadyFresh);
        assert_eq!(queue.enqueue(entity, Priority::Low, false), EnqueueOutcome::Queued);
        assert_eq!(queue.enqueue(entity, Priority::Low, false), EnqueueOutcome::AlreadyQueued);
        assert_eq!(queue.enqueue(entity, Priority::High, false), EnqueueOutcome::Promoted);

        let _start = started(queue.poll_next(Instant::now()));
        assert_eq!(
            queue.enqueue(entity, Priority::High, false),
            EnqueueOutcome::AlreadyInflight
        );
        assert_eq!(queue.queued_len(), 0, "never queued twice");
    }

    #[test]
    fn test_concurrency_and_spacing_are_bounded() {
        let mut queue = queue(2);
        let now = Instant::now();
        for id in 1..=4 {
            let _outcome = queue.enqueue(EntityRef::ticket(id), Priority::Normal, false);
        }

        let _first = started(queue.poll_next(now));
        assert_eq!(
            queue.poll_next(now),
            NextTask::WaitUntil(now + Duration::from_millis(50)),
            "spacing between starts"
        );

        let _second = started(queue.poll_next(now + Duration::from_millis(50)));
        assert_eq!(
            queue.poll_next(now + Duration::from_secs(1)),
            NextTask::Saturated,
            "two in flight already"
        );
        assert_eq!(queue.stats().peak_inflight, 2);
    }

    #[test]
    fn test_failed_fetch_is_retried_once() {
        let mut queue = queue(3);
        let entity = EntityRef::ticket(5);
        let now = Instant::now();
        let _outcome = queue.enqueue(entity, Priority::High, false);

        let _start = started(queue.poll_next(now));
        assert_eq!(queue.complete(&entity, false, now), Completion::RetryScheduled);

        let retry_at = now + Duration::from_millis(500);
        assert_eq!(
            queue.poll_next(now + Duration::from_millis(100)),
            NextTask::WaitUntil(retry_at),
            "retry waits for its delay"
        );

        let NextTask::Start(retry) = queue.poll_next(retry_at) else {
            panic!("retry should start after its delay");
        };
        assert_eq!(retry.priority, Priority::Normal, "retried at lowered priority");
        assert_eq!(retry.attempt, 1);

        assert_eq!(queue.complete(&entity, false, retry_at), Completion::Failed);
        assert_eq!(queue.enqueue(entity, Priority::High, false), EnqueueOutcome::GaveUp);

        queue.reset_failures();
        assert_eq!(queue.enqueue(entity, Priority::High, false), EnqueueOutcome::Queued);
    }

    #[test]
    fn test_cancel_and_demote_only_touch_queued_tasks() {
        let mut queue = queue(3);
        let now = Instant::now();
        let _outcome = queue.enqueue(EntityRef::ticket(1), Priority::High, false);
        let _outcome = queue.enqueue(EntityRef::ticket(2), Priority::High, false);
        let _outcome = queue.enqueue(EntityRef::ticket(3), Priority::Normal, false);

        assert!(queue.demote(&EntityRef::ticket(1)), "queued task demoted");
        assert!(queue.cancel(&EntityRef::ticket(2)), "queued task cancelled");

        assert_eq!(
            started(queue.poll_next(now)),
            EntityRef::ticket(3),
            "demoted task lost its place"
        );
        assert!(!queue.cancel(&EntityRef::ticket(3)), "in flight cannot be cancelled");
        assert_eq!(queue.stats().cancelled, 1);
    }
}
