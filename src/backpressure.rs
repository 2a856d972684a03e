//! Credit-based backpressure for streams.
//!
//! The consumer of a stream grants credit with `STREAM_BACK_PRESSURE`; the
//! producer spends one credit per `STREAM_DATA` item. Without credit the
//! producer waits. Credit is the only admission control on a stream.
//!
//! # Usage
//!
//! The [`CreditController`] sits inside each server-side stream session.
//! Producers interact with it through
//! [`StreamSink::send`](crate::server::StreamSink::send), which acquires
//! one credit before each item.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::sync::Notify;

use crate::error::{CallwireError, Result};

/// Credit counter shared by a stream's producer and its control messages.
///
/// Lock-free: grants and acquisitions are atomic operations, and waiters are
/// woken through a [`Notify`].
#[derive(Debug, Default)]
pub struct CreditController {
    /// Credit granted and not yet spent.
    credit: AtomicI64,
    /// Set once the stream is closed; wakes and fails all waiters.
    closed: AtomicBool,
    /// Wakes producers waiting for credit.
    notify: Notify,
}

impl CreditController {
    /// Create a controller with no credit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` credit and wake waiting producers.
    ///
    /// Non-positive amounts are ignored; a negative grant is a cancel, which
    /// the stream session handles before reaching the controller.
    pub fn grant(&self, amount: i64) -> i64 {
        if amount <= 0 {
            return self.available();
        }
        let mut current = self.credit.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(amount);
            match self.credit.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.notify.notify_waiters();
                    return next;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Spend one credit without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.credit.load(Ordering::Acquire);
        while current > 0 {
            match self.credit.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Spend one credit, waiting until some is granted.
    ///
    /// Returns `Err(StreamClosed)` once the controller is closed.
    pub async fn acquire(&self) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a grant between the check and the
            // await is not missed.
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(CallwireError::StreamClosed);
            }
            if self.try_acquire() {
                return Ok(());
            }

            notified.await;
        }
    }

    /// Close the controller and fail all current and future waiters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) was called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Credit currently available.
    #[inline]
    pub fn available(&self) -> i64 {
        self.credit.load(Ordering::Acquire)
    }
}
