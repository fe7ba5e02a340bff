//! Process-wide single-flight gate for outbound sends.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Age after which a held lock is presumed abandoned and may be reclaimed.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
struct LockState {
    held: bool,
    acquired_at: Option<Instant>,
    generation: u64,
}

/// Construct once per process and share it by `Arc` with every dispatcher.
#[derive(Debug)]
pub struct SendLock {
    state: Mutex<LockState>,
    stale_after: Duration,
}

impl Default for SendLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SendLock {
    pub fn new() -> Self {
        Self::with_stale_after(DEFAULT_STALE_AFTER)
    }

    pub fn with_stale_after(stale_after: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            stale_after,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Check-and-set without any suspension point.
    pub fn try_acquire(&self) -> bool {
        self.acquire().is_some()
    }

    /// Clears the held flag unconditionally. Calling it on a free lock is a no-op.
    pub fn release(&self) {
        let mut state = self.state();
        state.held = false;
        state.acquired_at = None;
    }

    pub fn is_held(&self) -> bool {
        self.state().held
    }

    /// Acquires the lock and ties its release to the returned permit.
    pub fn try_permit(self: &Arc<Self>) -> Option<SendPermit> {
        let generation = self.acquire()?;
        Some(SendPermit {
            lock: Arc::clone(self),
            generation,
        })
    }

    fn acquire(&self) -> Option<u64> {
        let mut state = self.state();
        let now = Instant::now();

        if state.held {
            let age = state
                .acquired_at
                .map(|acquired_at| now.saturating_duration_since(acquired_at));
            match age {
                Some(age) if age > self.stale_after => {
                    tracing::warn!(
                        held_for_ms = age.as_millis() as u64,
                        generation = state.generation,
                        "reclaiming stale send lock"
                    );
                }
                _ => return None,
            }
        }

        state.held = true;
        state.acquired_at = Some(now);
        state.generation = state.generation.wrapping_add(1);
        Some(state.generation)
    }

    fn release_generation(&self, generation: u64) {
        let mut state = self.state();
        // A reclaimed lock belongs to its new holder.
        if state.held && state.generation == generation {
            state.held = false;
            state.acquired_at = None;
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of lock ownership. Dropping it releases the lock on every exit path.
#[derive(Debug)]
pub struct SendPermit {
    lock: Arc<SendLock>,
    generation: u64,
}

impl SendPermit {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once a newer holder reclaimed the lock from this permit.
    pub fn is_current(&self) -> bool {
        let state = self.lock.state();
        state.held && state.generation == self.generation
    }
}

impl Drop for SendPermit {
    fn drop(&mut self) {
        self.lock.release_generation(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn second_acquire_is_rejected_until_release() {
        let lock = SendLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!lock.try_acquire());

        lock.release();
        assert!(lock.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_lock_is_reclaimed_after_window() {
        let lock = SendLock::new();
        assert!(lock.try_acquire());

        tokio::time::advance(DEFAULT_STALE_AFTER).await;
        assert!(!lock.try_acquire(), "exactly at the window is still held");

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire(), "reclaiming resets the timestamp");
    }

    #[test]
    fn release_is_idempotent() {
        let lock = SendLock::new();
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
        lock.release();
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn dropping_permit_releases() {
        let lock = Arc::new(SendLock::new());
        let permit = lock.try_permit().unwrap();
        assert!(lock.try_permit().is_none());

        drop(permit);
        assert!(!lock.is_held());
        assert!(lock.try_permit().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_permit_does_not_release_new_holder() {
        let lock = Arc::new(SendLock::new());
        let stale = lock.try_permit().unwrap();

        tokio::time::advance(DEFAULT_STALE_AFTER + Duration::from_secs(1)).await;
        let fresh = lock.try_permit().unwrap();
        assert_ne!(stale.generation(), fresh.generation());

        assert!(!stale.is_current());
        assert!(fresh.is_current());
        drop(stale);
        assert!(lock.is_held());

        drop(fresh);
        assert!(!lock.is_held());
    }
}
