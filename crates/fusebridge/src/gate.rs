//! Per-mount completion gate.
//!
//! Exactly one driver thread waits on a gate at a time, for the call it armed.
//! A completion carries the sequence number of the call it answers, so a
//! completion that arrives after its call was aborted is dropped instead of
//! answering the next call.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::reply::Completion;

#[derive(Debug)]
pub enum GateOutcome {
    Completed(Completion),
    Aborted,
}

#[derive(Debug, Default)]
struct GateState {
    armed: Option<u64>,
    next_seq: u64,
    outcome: Option<Completion>,
    aborted: bool,
}

#[derive(Debug, Default)]
pub struct CompletionGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a new call and returns its sequence number. Any outcome left
    /// over from a previous call is discarded.
    pub fn arm(&self) -> u64 {
        let mut state = self.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.armed = Some(seq);
        state.outcome = None;
        state.aborted = false;
        seq
    }

    /// Blocks until call `seq` is completed or aborted, then disarms.
    pub fn wait(&self, seq: u64) -> GateOutcome {
        let mut state = self.lock();
        loop {
            if state.armed != Some(seq) {
                return GateOutcome::Aborted;
            }
            if let Some(completion) = state.outcome.take() {
                state.armed = None;
                return GateOutcome::Completed(completion);
            }
            if state.aborted {
                state.armed = None;
                return GateOutcome::Aborted;
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Delivers the completion of call `seq`. Returns false, and drops the
    /// completion, when that call is no longer waiting or was already answered.
    pub fn signal(&self, seq: u64, completion: Completion) -> bool {
        let mut state = self.lock();
        if state.armed != Some(seq) || state.outcome.is_some() || state.aborted {
            return false;
        }
        state.outcome = Some(completion);
        self.cond.notify_all();
        true
    }

    /// Releases the waiter of call `seq` without a completion.
    pub fn abort(&self, seq: u64) -> bool {
        let mut state = self.lock();
        if state.armed != Some(seq) || state.outcome.is_some() {
            return false;
        }
        state.aborted = true;
        self.cond.notify_all();
        true
    }

    /// Abandons call `seq` before anyone waited on it.
    pub fn disarm(&self, seq: u64) {
        let mut state = self.lock();
        if state.armed == Some(seq) {
            state.armed = None;
            state.outcome = None;
        }
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.lock().armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::Payload;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_signal_before_wait() {
        let gate = CompletionGate::new();
        let seq = gate.arm();
        assert!(gate.signal(seq, Completion::new(0, Payload::Handle(9))));
        match gate.wait(seq) {
            GateOutcome::Completed(c) => {
                assert_eq!(c.code, 0);
                assert!(matches!(c.payload, Payload::Handle(9)));
            }
            GateOutcome::Aborted => panic!("expected completion"),
        }
        assert_eq!(gate.in_flight(), None);
    }

    #[test]
    fn test_wait_blocks_until_signal() {
        let gate = Arc::new(CompletionGate::new());
        let seq = gate.arm();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait(seq))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(gate.signal(seq, Completion::error(-libc::ENOENT)));
        match waiter.join().unwrap() {
            GateOutcome::Completed(c) => assert_eq!(c.code, -libc::ENOENT),
            GateOutcome::Aborted => panic!("expected completion"),
        }
    }

    #[test]
    fn test_second_signal_is_rejected() {
        let gate = CompletionGate::new();
        let seq = gate.arm();
        assert!(gate.signal(seq, Completion::error(-1)));
        assert!(!gate.signal(seq, Completion::error(-2)));
        match gate.wait(seq) {
            GateOutcome::Completed(c) => assert_eq!(c.code, -1),
            GateOutcome::Aborted => panic!("expected completion"),
        }
    }

    #[test]
    fn test_stale_signal_is_dropped() {
        let gate = CompletionGate::new();
        let first = gate.arm();
        assert!(gate.abort(first));
        assert!(matches!(gate.wait(first), GateOutcome::Aborted));

        let second = gate.arm();
        assert!(!gate.signal(first, Completion::error(-1)));
        assert!(gate.signal(second, Completion::new(3, Payload::None)));
        match gate.wait(second) {
            GateOutcome::Completed(c) => assert_eq!(c.code, 3),
            GateOutcome::Aborted => panic!("expected completion"),
        }
    }

    #[test]
    fn test_abort_releases_waiter() {
        let gate = Arc::new(CompletionGate::new());
        let seq = gate.arm();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait(seq))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(gate.abort(seq));
        assert!(matches!(waiter.join().unwrap(), GateOutcome::Aborted));
    }

    #[test]
    fn test_disarm_clears_in_flight() {
        let gate = CompletionGate::new();
        let seq = gate.arm();
        assert_eq!(gate.in_flight(), Some(seq));
        gate.disarm(seq);
        assert_eq!(gate.in_flight(), None);
        assert!(!gate.signal(seq, Completion::error(-1)));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let gate = CompletionGate::new();
        let a = gate.arm();
        gate.disarm(a);
        let b = gate.arm();
        assert!(b > a);
    }
}
