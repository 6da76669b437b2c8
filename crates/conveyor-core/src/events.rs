//! In-process event dispatch for job lifecycle notifications.
//!
//! Two event streams exist per job: `attempt` fires at the start and end of
//! every physical attempt (consumers observe state changes by reading
//! `job.status` on each callback), and `done` fires exactly once when the job
//! reaches a terminal state. Subscriptions are keyed by job type; the
//! wildcard topic `"*"` receives every event and is never treated as a
//! literal type. Per-uid callbacks let a submitter follow a single job
//! without subscribing to the whole type.
//!
//! Subscriber callbacks run on the worker's task. A panicking subscriber is
//! caught and logged; it never unwinds into the worker loop.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::models::Job;

/// Wildcard topic receiving events for every job type.
pub const WILDCARD_TOPIC: &str = "*";

/// Callback invoked with a snapshot of the job row.
pub type JobCallback = Arc<dyn Fn(&Job) + Send + Sync>;

/// Which stream a subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Attempt,
    Done,
}

struct Subscriber {
    id: u64,
    callback: JobCallback,
}

#[derive(Default)]
struct TopicRegistry {
    next_id: u64,
    by_topic: HashMap<String, Vec<Subscriber>>,
}

impl TopicRegistry {
    /// Add a subscriber, honoring dedup. Returns the subscription id, or
    /// `None` when the same callback is already subscribed to the topic.
    fn add(&mut self, topic: &str, callback: &JobCallback, dedup: bool) -> Option<u64> {
        let entries = self.by_topic.entry(topic.to_string()).or_default();
        if dedup
            && entries
                .iter()
                .any(|s| Arc::ptr_eq(&s.callback, callback))
        {
            return None;
        }
        self.next_id += 1;
        let id = self.next_id;
        entries.push(Subscriber {
            id,
            callback: callback.clone(),
        });
        Some(id)
    }

    fn remove(&mut self, topic: &str, id: u64) {
        if let Some(entries) = self.by_topic.get_mut(topic) {
            entries.retain(|s| s.id != id);
            if entries.is_empty() {
                self.by_topic.remove(topic);
            }
        }
    }

    /// Snapshot the callbacks for a type plus the wildcard topic. Cloned out
    /// so subscribers can unsubscribe from within their own callback.
    fn callbacks_for(&self, job_type: &str) -> Vec<JobCallback> {
        let mut out = Vec::new();
        if let Some(entries) = self.by_topic.get(job_type) {
            out.extend(entries.iter().map(|s| s.callback.clone()));
        }
        if job_type != WILDCARD_TOPIC {
            if let Some(entries) = self.by_topic.get(WILDCARD_TOPIC) {
                out.extend(entries.iter().map(|s| s.callback.clone()));
            }
        }
        out
    }

    fn subscriber_count(&self) -> usize {
        self.by_topic.values().map(Vec::len).sum()
    }
}

/// Handle for removing a topic subscription.
///
/// Dropping the handle does **not** unsubscribe; call [`Subscription::unsubscribe`].
#[must_use = "keep the subscription handle to be able to unsubscribe"]
pub struct Subscription {
    bus: Weak<JobEventBus>,
    kind: EventKind,
    entries: Vec<(String, u64)>,
}

impl Subscription {
    /// Remove every topic entry this subscription created.
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let registry = match self.kind {
            EventKind::Attempt => &bus.attempt_subs,
            EventKind::Done => &bus.done_subs,
        };
        let mut registry = registry.lock().unwrap();
        for (topic, id) in &self.entries {
            registry.remove(topic, *id);
        }
    }

    /// Number of live topic entries (0 when dedup collapsed everything).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Topic-keyed dispatcher for `attempt` and `done` events plus per-uid
/// one-shot callback registries.
pub struct JobEventBus {
    dedup: bool,
    attempt_subs: Mutex<TopicRegistry>,
    done_subs: Mutex<TopicRegistry>,
    attempt_for_uid: Mutex<HashMap<Uuid, Vec<JobCallback>>>,
    done_for_uid: Mutex<HashMap<Uuid, Vec<JobCallback>>>,
}

impl JobEventBus {
    /// Create a bus. `dedup` collapses duplicate (topic, callback) pairs.
    pub fn new(dedup: bool) -> Arc<Self> {
        Arc::new(Self {
            dedup,
            attempt_subs: Mutex::new(TopicRegistry::default()),
            done_subs: Mutex::new(TopicRegistry::default()),
            attempt_for_uid: Mutex::new(HashMap::new()),
            done_for_uid: Mutex::new(HashMap::new()),
        })
    }

    /// Subscribe to `attempt` events for the given job types.
    pub fn subscribe_attempt(
        self: &Arc<Self>,
        topics: &[&str],
        callback: JobCallback,
    ) -> Subscription {
        self.subscribe(EventKind::Attempt, topics, callback)
    }

    /// Subscribe to `done` events for the given job types.
    pub fn subscribe_done(
        self: &Arc<Self>,
        topics: &[&str],
        callback: JobCallback,
    ) -> Subscription {
        self.subscribe(EventKind::Done, topics, callback)
    }

    fn subscribe(
        self: &Arc<Self>,
        kind: EventKind,
        topics: &[&str],
        callback: JobCallback,
    ) -> Subscription {
        let registry = match kind {
            EventKind::Attempt => &self.attempt_subs,
            EventKind::Done => &self.done_subs,
        };
        let mut registry = registry.lock().unwrap();
        let mut entries = Vec::with_capacity(topics.len());
        for topic in topics {
            if let Some(id) = registry.add(topic, &callback, self.dedup) {
                entries.push((topic.to_string(), id));
            }
        }
        Subscription {
            bus: Arc::downgrade(self),
            kind,
            entries,
        }
    }

    /// Register a per-uid `attempt` callback. Removed when the job is done.
    pub fn on_attempt_for(&self, uid: Uuid, callback: JobCallback) {
        self.attempt_for_uid
            .lock()
            .unwrap()
            .entry(uid)
            .or_default()
            .push(callback);
    }

    /// Register a per-uid `done` callback. Invoked at most once, then removed.
    pub fn on_done_for(&self, uid: Uuid, callback: JobCallback) {
        self.done_for_uid
            .lock()
            .unwrap()
            .entry(uid)
            .or_default()
            .push(callback);
    }

    /// Publish an `attempt` event: type subscribers, wildcard subscribers,
    /// then per-uid attempt callbacks.
    pub fn publish_attempt(&self, job: &Job) {
        let callbacks = self
            .attempt_subs
            .lock()
            .unwrap()
            .callbacks_for(&job.job_type);
        Self::invoke_all(&callbacks, job, "attempt");

        let uid_callbacks = self
            .attempt_for_uid
            .lock()
            .unwrap()
            .get(&job.uid)
            .cloned()
            .unwrap_or_default();
        Self::invoke_all(&uid_callbacks, job, "attempt_for");
    }

    /// Publish a `done` event and drain the job's per-uid registries.
    ///
    /// Only terminal jobs should be published here; the per-uid `attempt`
    /// callbacks are removed alongside the `done` ones so a finished job
    /// leaves nothing behind.
    pub fn publish_done(&self, job: &Job) {
        let callbacks = self.done_subs.lock().unwrap().callbacks_for(&job.job_type);
        Self::invoke_all(&callbacks, job, "done");

        let uid_callbacks = self
            .done_for_uid
            .lock()
            .unwrap()
            .remove(&job.uid)
            .unwrap_or_default();
        Self::invoke_all(&uid_callbacks, job, "done_for");

        self.attempt_for_uid.lock().unwrap().remove(&job.uid);
    }

    /// Number of live topic subscribers on the given stream.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        match kind {
            EventKind::Attempt => self.attempt_subs.lock().unwrap().subscriber_count(),
            EventKind::Done => self.done_subs.lock().unwrap().subscriber_count(),
        }
    }

    /// Number of uids with pending per-uid callbacks.
    pub fn tracked_uid_count(&self) -> usize {
        let done = self.done_for_uid.lock().unwrap().len();
        let attempt = self.attempt_for_uid.lock().unwrap().len();
        done.max(attempt)
    }

    fn invoke_all(callbacks: &[JobCallback], job: &Job, stream: &str) {
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(job))).is_err() {
                tracing::error!(
                    subsystem = "events",
                    job_uid = %job.uid,
                    job_type = %job.job_type,
                    stream,
                    "Subscriber callback panicked; continuing"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BackoffStrategy, JobStatus};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_job(job_type: &str, status: JobStatus) -> Job {
        Job {
            id: 1,
            uid: Uuid::new_v4(),
            job_type: job_type.to_string(),
            payload: json!({}),
            status,
            result: json!({}),
            attempts: 1,
            max_attempts: 3,
            max_attempt_duration_ms: 0,
            backoff_strategy: BackoffStrategy::Exp,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            run_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    fn counter_callback() -> (JobCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let cb: JobCallback = Arc::new(move |_job| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        (cb, count)
    }

    #[test]
    fn test_attempt_subscribers_receive_matching_type() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let _sub = bus.subscribe_attempt(&["email.send"], cb);

        bus.publish_attempt(&test_job("email.send", JobStatus::Running));
        bus.publish_attempt(&test_job("report.build", JobStatus::Running));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wildcard_receives_every_type() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let _sub = bus.subscribe_done(&[WILDCARD_TOPIC], cb);

        bus.publish_done(&test_job("a", JobStatus::Completed));
        bus.publish_done(&test_job("b", JobStatus::Failed));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wildcard_is_not_a_literal_type() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let _sub = bus.subscribe_attempt(&["*"], cb);

        // A job whose type happens to be "*" must not double-invoke.
        bus.publish_attempt(&test_job("*", JobStatus::Running));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dedup_collapses_duplicate_subscription() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let sub1 = bus.subscribe_attempt(&["t"], cb.clone());
        let sub2 = bus.subscribe_attempt(&["t"], cb);
        assert_eq!(sub1.len(), 1);
        assert!(sub2.is_empty());

        bus.publish_attempt(&test_job("t", JobStatus::Running));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dedup_disabled_allows_duplicates() {
        let bus = JobEventBus::new(false);
        let (cb, count) = counter_callback();
        let _sub1 = bus.subscribe_attempt(&["t"], cb.clone());
        let _sub2 = bus.subscribe_attempt(&["t"], cb);

        bus.publish_attempt(&test_job("t", JobStatus::Running));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_removes_callback() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let sub = bus.subscribe_done(&["t"], cb);
        assert_eq!(bus.subscriber_count(EventKind::Done), 1);

        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(EventKind::Done), 0);

        bus.publish_done(&test_job("t", JobStatus::Completed));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multi_topic_subscription() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let sub = bus.subscribe_attempt(&["a", "b"], cb);
        assert_eq!(sub.len(), 2);

        bus.publish_attempt(&test_job("a", JobStatus::Running));
        bus.publish_attempt(&test_job("b", JobStatus::Running));
        bus.publish_attempt(&test_job("c", JobStatus::Running));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        bus.publish_attempt(&test_job("a", JobStatus::Running));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_per_uid_done_callback_fires_once_and_clears() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let job = test_job("t", JobStatus::Completed);
        bus.on_done_for(job.uid, cb);
        assert_eq!(bus.tracked_uid_count(), 1);

        bus.publish_done(&job);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.tracked_uid_count(), 0);

        // A second publish finds nothing to invoke.
        bus.publish_done(&job);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_per_uid_attempt_callbacks_survive_until_done() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let mut job = test_job("t", JobStatus::Running);
        bus.on_attempt_for(job.uid, cb);

        bus.publish_attempt(&job);
        bus.publish_attempt(&job);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        job.status = JobStatus::Completed;
        bus.publish_done(&job);

        // Registry cleared with the done event.
        bus.publish_attempt(&job);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_uid_callbacks_are_isolated_per_job() {
        let bus = JobEventBus::new(true);
        let (cb, count) = counter_callback();
        let tracked = test_job("t", JobStatus::Running);
        let other = test_job("t", JobStatus::Running);
        bus.on_attempt_for(tracked.uid, cb);

        bus.publish_attempt(&other);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.publish_attempt(&tracked);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_subscriber_does_not_poison_the_bus() {
        let bus = JobEventBus::new(true);
        let panicking: JobCallback = Arc::new(|_job| panic!("subscriber bug"));
        let (cb, count) = counter_callback();
        let _sub1 = bus.subscribe_attempt(&["t"], panicking);
        let _sub2 = bus.subscribe_attempt(&["t"], cb);

        bus.publish_attempt(&test_job("t", JobStatus::Running));

        // The well-behaved subscriber still ran.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_after_bus_dropped_is_noop() {
        let bus = JobEventBus::new(true);
        let (cb, _count) = counter_callback();
        let sub = bus.subscribe_attempt(&["t"], cb);
        drop(bus);
        sub.unsubscribe();
    }
}
