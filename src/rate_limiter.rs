use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    delay: Duration,
    last_scheduled: Option<Instant>,
    queue: VecDeque<Job>,
    timer_armed: bool,
}

/// Per-operation scheduler enforcing a minimum delay between dispatched
/// jobs, with multiplicative backoff on failure and multiplicative recovery
/// on success (spec.md §4.1).
///
/// Only one job is ever in flight from the queue at a time; `success`/`fail`
/// affect the delay used for *future* schedules, never the already-armed
/// timer.
pub struct RateLimiter {
    min: Duration,
    max: Duration,
    failed_mult: f64,
    success_mult: f64,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(min: Duration, max: Duration, failed_mult: f64, success_mult: f64) -> Arc<Self> {
        assert!(failed_mult > 1.0);
        assert!(success_mult > 0.0 && success_mult <= 1.0);
        Arc::new(RateLimiter {
            min,
            max,
            failed_mult,
            success_mult,
            state: Mutex::new(State {
                delay: min,
                last_scheduled: None,
                queue: VecDeque::new(),
                timer_armed: false,
            }),
        })
    }

    /// Schedule `f` to run after the current delay has elapsed since the
    /// last dispatch. Appends to a FIFO queue; only arms a timer if none is
    /// already running.
    pub async fn schedule<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().await;
        state.queue.push_back(Box::new(f));
        if !state.timer_armed {
            state.timer_armed = true;
            let wait = self.next_wait(&state);
            drop(state);
            self.arm_timer(wait);
        }
    }

    fn next_wait(&self, state: &State) -> Duration {
        match state.last_scheduled {
            None => Duration::ZERO,
            Some(last) => {
                let earliest = last + state.delay;
                earliest.saturating_duration_since(Instant::now())
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, wait: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            this.fire().await;
        });
    }

    async fn fire(self: &Arc<Self>) {
        let job = {
            let mut state = self.state.lock().await;
            let job = state.queue.pop_front();
            state.last_scheduled = Some(Instant::now());
            job
        };
        if let Some(job) = job {
            job();
        }
        let mut state = self.state.lock().await;
        if state.queue.is_empty() {
            state.timer_armed = false;
        } else {
            let delay = state.delay;
            drop(state);
            self.arm_timer(delay);
        }
    }

    /// Record a success: shrink the delay toward `min`.
    pub async fn success(&self) {
        let mut state = self.state.lock().await;
        let scaled = state.delay.mul_f64(self.success_mult);
        state.delay = scaled.max(self.min);
    }

    /// Record a failure: grow the delay toward `max`.
    pub async fn fail(&self) {
        let mut state = self.state.lock().await;
        let scaled = state.delay.mul_f64(self.failed_mult);
        state.delay = scaled.min(self.max);
    }

    #[cfg(test)]
    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.delay
    }
}
