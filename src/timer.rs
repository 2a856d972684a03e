//! Coarse hashed timer wheel.
//!
//! One wheel per connection schedules every call timeout and stream-open
//! deadline. Scheduling is O(1): an entry is dropped into the slot
//! `ticks` ahead of the cursor with a round counter for delays longer than
//! one revolution. Cancellation is lazy; a cancelled entry stays in its
//! slot until the cursor reaches it and is then discarded.
//!
//! A single tokio task advances the cursor once per tick. Expired callbacks
//! run on that task, outside the wheel lock, so they may schedule or cancel
//! other timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    rounds: u64,
    cancelled: Arc<AtomicBool>,
    callback: Callback,
}

struct WheelState {
    cursor: usize,
    slots: Vec<Vec<TimerEntry>>,
}

struct WheelInner {
    tick: Duration,
    state: Mutex<WheelState>,
}

/// Handle to one scheduled timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Prevent the callback from running. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[cfg(test)]
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Hashed timer wheel driven by a tokio task.
pub struct TimerWheel {
    inner: Arc<WheelInner>,
    stop: CancellationToken,
}

impl TimerWheel {
    /// Start a wheel with the given tick and slot count.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(tick: Duration, wheel_size: usize) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let inner = Arc::new(WheelInner {
            tick,
            state: Mutex::new(WheelState {
                cursor: 0,
                slots: (0..wheel_size.max(1)).map(|_| Vec::new()).collect(),
            }),
        });
        let stop = CancellationToken::new();

        let driver = inner.clone();
        let stopped = stop.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + driver.tick, driver.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = ticker.tick() => driver.advance(),
                }
            }
            tracing::trace!("Timer wheel stopped");
        });

        Self { inner, stop }
    }

    /// Run `callback` once `delay` has elapsed, rounded up to whole ticks
    /// (at least one).
    ///
    /// On a stopped wheel the callback is dropped and the returned handle is
    /// already cancelled.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let ticks = ticks_for(delay, self.inner.tick);

        let mut state = self.inner.state.lock();
        if self.stop.is_cancelled() {
            return TimerHandle {
                cancelled: Arc::new(AtomicBool::new(true)),
            };
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let size = state.slots.len() as u64;
        let slot = ((state.cursor as u64 % size + ticks % size) % size) as usize;
        state.slots[slot].push(TimerEntry {
            rounds: (ticks - 1) / size,
            cancelled: cancelled.clone(),
            callback: Box::new(callback),
        });

        TimerHandle { cancelled }
    }

    /// Stop the driver task. Pending callbacks never run.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        self.stop.cancel();
        for slot in state.slots.iter_mut() {
            slot.clear();
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.inner.state.lock().slots.iter().all(Vec::is_empty)
    }

    #[cfg(test)]
    fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl WheelInner {
    fn advance(&self) {
        let due = {
            let mut state = self.state.lock();
            state.cursor = (state.cursor + 1) % state.slots.len();
            let cursor = state.cursor;
            let entries = std::mem::take(&mut state.slots[cursor]);

            let mut due = Vec::new();
            for mut entry in entries {
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                if entry.rounds == 0 {
                    due.push(entry);
                } else {
                    entry.rounds -= 1;
                    state.slots[cursor].push(entry);
                }
            }
            due
        };

        for entry in due {
            if !entry.cancelled.load(Ordering::Acquire) {
                (entry.callback)();
            }
        }
    }
}

fn ticks_for(delay: Duration, tick: Duration) -> u64 {
    let tick_nanos = tick.as_nanos().max(1);
    let ticks = delay.as_nanos().div_ceil(tick_nanos);
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn test_ticks_round_up() {
        let tick = Duration::from_millis(10);
        assert_eq!(ticks_for(Duration::ZERO, tick), 1);
        assert_eq!(ticks_for(Duration::from_millis(10), tick), 1);
        assert_eq!(ticks_for(Duration::from_millis(11), tick), 2);
        assert_eq!(ticks_for(Duration::from_millis(3000), tick), 300);
        assert_eq!(ticks_for(Duration::MAX, tick), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_delay_does_not_fire() {
        let wheel = TimerWheel::start(Duration::from_millis(10), 8);
        let (count, make) = counter();
        wheel.schedule(Duration::MAX, make());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let wheel = TimerWheel::start(Duration::from_millis(10), 8);
        let (count, make) = counter();
        wheel.schedule(Duration::from_millis(50), make());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_longer_than_one_revolution() {
        // 4 slots * 10ms = 40ms per revolution
        let wheel = TimerWheel::start(Duration::from_millis(10), 4);
        let (count, make) = counter();
        wheel.schedule(Duration::from_millis(95), make());

        tokio::time::sleep(Duration::from_millis(85)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_does_not_fire() {
        let wheel = TimerWheel::start(Duration::from_millis(10), 8);
        let (count, make) = counter();
        let handle = wheel.schedule(Duration::from_millis(20), make());
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_schedule_again() {
        let wheel = Arc::new(TimerWheel::start(Duration::from_millis(10), 8));
        let (count, make) = counter();
        let inner_cb = make();
        let w = wheel.clone();
        wheel.schedule(Duration::from_millis(10), move || {
            w.schedule(Duration::from_millis(10), inner_cb);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_pending() {
        let wheel = TimerWheel::start(Duration::from_millis(10), 8);
        let (count, make) = counter();
        wheel.schedule(Duration::from_millis(30), make());
        wheel.stop();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(wheel.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_stop_is_refused() {
        let wheel = TimerWheel::start(Duration::from_millis(10), 8);
        wheel.stop();

        let (count, make) = counter();
        let handle = wheel.schedule(Duration::from_millis(10), make());
        assert!(handle.is_cancelled());
        assert!(wheel.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
