//! Short-lived "suppress outbound echo" flag shared by the bridge and poller.
//!
//! A flag is raised for one round of propagation: either a remote change is
//! being applied to the local player (`EchoOrigin::Remote`), or a local command
//! is on its way to the receiver (`EchoOrigin::Local`). Every raise arms a
//! grace timer, so the flag can never stay set indefinitely.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::debug;
use tokio::task::JoinHandle;

/// Which side started the round of propagation the flag is guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOrigin {
    Local,
    Remote,
}

#[derive(Default)]
struct EchoState {
    origin: Option<EchoOrigin>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct AntiEchoFlag {
    state: Arc<Mutex<EchoState>>,
    grace: Duration,
}

impl AntiEchoFlag {
    pub fn new(grace: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(EchoState::default())),
            grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EchoState> {
        match self.state.lock() {
            Ok(locked) => locked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Raises the flag and (re)arms its grace timer. Must be called from a tokio runtime.
    pub fn raise(&self, origin: EchoOrigin) {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        state.origin = Some(origin);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let shared = Arc::clone(&self.state);
        let grace = self.grace;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut state = match shared.lock() {
                Ok(locked) => locked,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.generation == generation && state.origin.is_some() {
                debug!("AntiEchoFlag: grace window elapsed, clearing {:?}", state.origin);
                state.origin = None;
                state.timer = None;
            }
        }));
    }

    pub fn clear(&self) {
        Self::clear_locked(&mut self.lock());
    }

    /// Clears the flag only if it was raised by `origin`; returns whether it was.
    pub fn clear_if(&self, origin: EchoOrigin) -> bool {
        let mut state = self.lock();
        if state.origin != Some(origin) {
            return false;
        }
        Self::clear_locked(&mut state);
        true
    }

    fn clear_locked(state: &mut EchoState) {
        state.generation = state.generation.wrapping_add(1);
        state.origin = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    pub fn is_raised(&self) -> bool {
        self.lock().origin.is_some()
    }

    pub fn origin(&self) -> Option<EchoOrigin> {
        self.lock().origin
    }
}

#[cfg(test)]
mod tests {
    use super::{AntiEchoFlag, EchoOrigin};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_flag_clears_itself_after_grace_window() {
        let flag = AntiEchoFlag::new(Duration::from_millis(500));
        flag.raise(EchoOrigin::Remote);
        assert!(flag.is_raised());

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(flag.is_raised());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!flag.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reraise_restarts_grace_window() {
        let flag = AntiEchoFlag::new(Duration::from_millis(500));
        flag.raise(EchoOrigin::Local);
        tokio::time::sleep(Duration::from_millis(400)).await;
        flag.raise(EchoOrigin::Remote);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(flag.origin(), Some(EchoOrigin::Remote));
        tokio::time::sleep(Duration::from_millis(101)).await;
        assert!(!flag.is_raised());
    }

    #[tokio::test]
    async fn test_clear_if_only_clears_matching_origin() {
        let flag = AntiEchoFlag::new(Duration::from_secs(60));
        flag.raise(EchoOrigin::Local);
        assert!(!flag.clear_if(EchoOrigin::Remote));
        assert!(flag.is_raised());
        assert!(flag.clear_if(EchoOrigin::Local));
        assert!(!flag.is_raised());
    }
}
