//! Retry queue for LLM-dependent jobs.
//!
//! Jittered exponential schedule: `base * 2^attempt`, jittered ±25%, up to
//! the configured retry cap. The RNG is a seeded ChaCha8 so retry timing is
//! reproducible under test.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::learning::SlotId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryJob {
    pub slot: SlotId,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    due_ms: i64,
    seq: u64,
    job: RetryJob,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due_ms, self.seq).cmp(&(other.due_ms, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct RetryQueue {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    rng: Mutex<ChaCha8Rng>,
    seq: Mutex<u64>,
    base_delay: Duration,
    max_retries: u32,
}

impl RetryQueue {
    pub fn new(base_delay: Duration, max_retries: u32, seed: u64) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            seq: Mutex::new(0),
            base_delay,
            max_retries,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Delay for an attempt: `base * 2^attempt` jittered ±25%.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let backoff = base_ms * 2f64.powi(attempt.min(16) as i32);
        let jitter: f64 = self.rng.lock().gen_range(0.75..1.25);
        Duration::from_millis((backoff * jitter) as u64)
    }

    /// Schedule the next attempt. Returns `false` when the job has
    /// exhausted its retries and should be parked instead.
    pub fn schedule(&self, job: RetryJob, now: DateTime<Utc>) -> bool {
        if job.attempt >= self.max_retries {
            return false;
        }
        let delay = self.delay_for(job.attempt);
        let due = now + ChronoDuration::milliseconds(delay.as_millis() as i64);
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };
        self.heap.lock().push(Reverse(Entry {
            due_ms: due.timestamp_millis(),
            seq,
            job,
        }));
        true
    }

    /// Queue a job for the next retry-loop pass with no backoff.
    pub fn schedule_immediate(&self, job: RetryJob, now: DateTime<Utc>) {
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };
        self.heap.lock().push(Reverse(Entry {
            due_ms: now.timestamp_millis(),
            seq,
            job,
        }));
    }

    /// Pop every job whose due time has passed.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<RetryJob> {
        let now_ms = now.timestamp_millis();
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(e)| e.due_ms <= now_ms) {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry.job);
            }
        }
        due
    }
}
