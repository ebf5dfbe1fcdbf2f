/// Advisory, reentrant session lock.
///
/// Session operations never take this lock themselves. Applications sharing a session
/// between threads use it to group several operations into one uninterrupted sequence.
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use anyhow::anyhow;

use crate::Error;

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

#[derive(Default)]
pub struct SessionLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        match self.state.lock() {
            Ok(x) => x,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Block until the lock is free or already held by the current thread.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => {
                    state = match self.released.wait(state) {
                        Ok(x) => x,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one level of locking. Fails if the current thread does not hold the lock.
    pub fn unlock(&self) -> crate::Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.owner != Some(me) {
            return Err(Error::configuration(anyhow!(
                "Session lock is not held by this thread"
            )));
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_all();
        }
        Ok(())
    }

    pub fn guard(&self) -> SessionLockGuard<'_> {
        self.lock();
        SessionLockGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        self.state().owner.is_some()
    }

    /// How often the current owner has acquired the lock.
    pub fn depth(&self) -> usize {
        self.state().depth
    }
}

pub struct SessionLockGuard<'a> {
    lock: &'a SessionLock,
}

impl<'a> Drop for SessionLockGuard<'a> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.unlock() {
            log::warn!("{}", err);
        }
    }
}
