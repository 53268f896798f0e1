//! Node-wide token bucket for one work class.
//!
//! A token bucket holds a bounded number of byte tokens. Deducting more tokens
//! than are available does not fail: the caller is queued and suspended until
//! concurrent returns refill the bucket. Waiters are granted in strict FIFO
//! order, so a large request at the head of the queue is never starved by a
//! stream of smaller ones.
//!
//! The bucket never refills on its own. Tokens come back only through
//! [`TokenBucket::return_tokens`], which clamps at capacity.
//!
//! ```text
//!   deduct(n) ──▶ available >= n and queue empty? ──yes──▶ granted
//!                        │ no
//!                        ▼
//!                  FIFO waiter queue ◀── return_tokens(n) grants from the head
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use kvflow_core::WorkClass;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{FlowError, FlowResult};

/// Outcome delivered to a queued deduction.
#[derive(Debug)]
enum Grant {
    /// Tokens were taken from the bucket on the waiter's behalf.
    Granted,
    /// The bucket shrank below the request; it can never be granted.
    Rejected { capacity: u64 },
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tokens: u64,
    grant: oneshot::Sender<Grant>,
}

#[derive(Debug)]
struct BucketState {
    capacity: u64,
    available: u64,
    /// Tokens still owed after a capacity shrink found too few available.
    /// Paid from future returns before `available` grows again.
    debt: u64,
    /// Bytes dropped by the return clamp.
    clamped: u64,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

impl BucketState {
    /// Adds returned tokens, paying off shrink debt first and clamping at capacity.
    ///
    /// Returns the number of tokens dropped by the clamp.
    fn credit(&mut self, tokens: u64) -> u64 {
        let paid = tokens.min(self.debt);
        self.debt -= paid;
        let tokens = tokens - paid;

        let room = self.capacity - self.available;
        if tokens > room {
            self.available = self.capacity;
            let excess = tokens - room;
            self.clamped += excess;
            excess
        } else {
            self.available += tokens;
            0
        }
    }

    /// Grants queued deductions from the head while they fit.
    fn grant_waiters(&mut self, class: WorkClass) {
        while self
            .waiters
            .front()
            .is_some_and(|head| head.tokens <= self.available)
        {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.available -= waiter.tokens;
            if waiter.grant.send(Grant::Granted).is_err() {
                // Receiver went away between dequeue and send.
                self.available += waiter.tokens;
                continue;
            }
            trace!(
                %class,
                waiter = waiter.id,
                tokens = waiter.tokens,
                available = self.available,
                "Granted queued deduction"
            );
        }
    }
}

/// A capacity-bounded byte counter shared by every stream of one work class.
///
/// # Invariants
///
/// - `0 <= available <= capacity` at all times.
/// - Queued deductions are granted in arrival order.
///
/// # Thread Safety
///
/// The bucket is `Send + Sync`. Its mutex is held only for bookkeeping and is
/// never held across an `.await`.
#[derive(Debug)]
pub struct TokenBucket {
    class: WorkClass,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket with the given capacity.
    #[must_use]
    pub const fn new(class: WorkClass, capacity: u64) -> Self {
        Self {
            class,
            state: Mutex::new(BucketState {
                capacity,
                available: capacity,
                debt: 0,
                clamped: 0,
                next_waiter_id: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Returns the work class this bucket throttles.
    #[must_use]
    pub const fn class(&self) -> WorkClass {
        self.class
    }

    /// Returns a snapshot of the available tokens.
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.lock().available
    }

    /// Returns the bucket capacity.
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.lock().capacity
    }

    /// Returns the total bytes dropped by the return clamp.
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    #[must_use]
    pub fn clamped(&self) -> u64 {
        self.lock().clamped
    }

    /// Returns the number of queued deductions.
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Deducts tokens without waiting.
    ///
    /// Fails if the tokens are not available or another deduction is already
    /// queued ahead of this one.
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    pub fn try_deduct(&self, tokens: u64) -> bool {
        if tokens == 0 {
            return true;
        }
        let mut state = self.lock();
        if state.waiters.is_empty() && state.available >= tokens {
            state.available -= tokens;
            true
        } else {
            false
        }
    }

    /// Deducts tokens, waiting until they are available.
    ///
    /// Returns the time spent blocked (zero when the tokens were available
    /// immediately). Dropping the returned future or firing `cancel` before the
    /// grant leaves the bucket untouched.
    ///
    /// # Errors
    ///
    /// - `FlowError::ExceedsCapacity` if `tokens` can never fit in the bucket.
    /// - `FlowError::Cancelled` if `cancel` fires before the grant.
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    pub async fn deduct(&self, tokens: u64, cancel: &CancellationToken) -> FlowResult<Duration> {
        if tokens == 0 {
            return Ok(Duration::ZERO);
        }

        let (id, rx) = {
            let mut state = self.lock();
            if tokens > state.capacity {
                return Err(FlowError::ExceedsCapacity {
                    class: self.class,
                    requested: tokens,
                    capacity: state.capacity,
                });
            }
            if state.waiters.is_empty() && state.available >= tokens {
                state.available -= tokens;
                return Ok(Duration::ZERO);
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                tokens,
                grant: tx,
            });
            debug!(
                class = %self.class,
                waiter = id,
                tokens,
                available = state.available,
                queued = state.waiters.len(),
                "Deduction waiting for tokens"
            );
            (id, rx)
        };

        let started = Instant::now();
        let mut pending = PendingDeduction {
            bucket: self,
            id,
            tokens,
            rx,
            settled: false,
        };

        tokio::select! {
            biased;
            grant = &mut pending.rx => {
                pending.settled = true;
                match grant {
                    Ok(Grant::Granted) => Ok(started.elapsed()),
                    Ok(Grant::Rejected { capacity }) => Err(FlowError::ExceedsCapacity {
                        class: self.class,
                        requested: tokens,
                        capacity,
                    }),
                    // The sender only disappears with the bucket itself.
                    Err(_) => Err(FlowError::Cancelled {
                        class: self.class,
                        requested: tokens,
                    }),
                }
            }
            () = cancel.cancelled() => Err(FlowError::Cancelled {
                class: self.class,
                requested: tokens,
            }),
        }
    }

    /// Returns tokens to the bucket and wakes queued deductions that now fit.
    ///
    /// Tokens beyond capacity are dropped and counted in [`Self::clamped`].
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    pub fn return_tokens(&self, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let mut state = self.lock();
        let excess = state.credit(tokens);
        if excess > 0 {
            warn!(
                class = %self.class,
                tokens,
                excess,
                capacity = state.capacity,
                "Returned tokens overflow capacity, dropping excess"
            );
        }
        state.grant_waiters(self.class);
    }

    /// Changes the bucket capacity.
    ///
    /// Growing adds the difference to `available`. Shrinking removes the
    /// difference from `available`; whatever cannot be removed now is taken
    /// from future returns. Queued deductions larger than the new capacity
    /// fail with `FlowError::ExceedsCapacity`.
    ///
    /// # Panics
    ///
    /// Panics if the bucket mutex is poisoned.
    pub fn set_capacity(&self, capacity: u64) {
        let mut state = self.lock();
        let old = state.capacity;
        if capacity == old {
            return;
        }

        if capacity > old {
            let grow = capacity - old;
            let paid = grow.min(state.debt);
            state.debt -= paid;
            state.available += grow - paid;
        } else {
            let shrink = old - capacity;
            let taken = shrink.min(state.available);
            state.available -= taken;
            state.debt += shrink - taken;
        }
        state.capacity = capacity;

        let mut kept = VecDeque::with_capacity(state.waiters.len());
        for waiter in state.waiters.drain(..) {
            if waiter.tokens > capacity {
                let _ = waiter.grant.send(Grant::Rejected { capacity });
            } else {
                kept.push_back(waiter);
            }
        }
        state.waiters = kept;

        info!(
            class = %self.class,
            old_capacity = old,
            new_capacity = capacity,
            available = state.available,
            "Token bucket resized"
        );
        state.grant_waiters(self.class);
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().expect("token bucket lock poisoned")
    }
}

/// A queued deduction that has not yet been granted or abandoned.
///
/// Dropping it before the grant is observed deregisters the waiter, or credits
/// the tokens back if a grant raced with the drop.
struct PendingDeduction<'a> {
    bucket: &'a TokenBucket,
    id: u64,
    tokens: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl Drop for PendingDeduction<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let class = self.bucket.class;
        let mut state = self.bucket.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            debug!(%class, waiter = self.id, tokens = self.tokens, "Deduction abandoned while queued");
        } else if let Ok(Grant::Granted) = self.rx.try_recv() {
            // Granted under the lock before we got here; give the tokens back.
            state.credit(self.tokens);
            debug!(%class, waiter = self.id, tokens = self.tokens, "Deduction abandoned after grant");
        }
        // The head may have been the blocker for smaller requests behind it.
        state.grant_waiters(class);
    }
}
