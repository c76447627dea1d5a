// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ordering monitors: apply/commit gates that enforce dependency order
//! over appliers (§4.3).
//!
//! Generalizes a single-waiter wake notifier's atomic-fast-path /
//! condvar-slow-path split from a single waiter to a per-seqno ticket
//! queue: entry blocks on a [`parking_lot::Condvar`] until every seqno a
//! ticket depends on has drained, exit advances the drain frontier and
//! wakes everyone else to re-check their own readiness.

use crate::error::MonitorError;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashSet};

struct State {
    /// Every seqno `<= drained_to` has exited (or self-cancelled), with
    /// no gap - the contiguous floor [`OrderingMonitor::drain`] waits on.
    drained_to: i64,
    /// Seqnos currently inside the monitor (entered, not yet exited),
    /// mapped to whether they are PA-unsafe.
    in_flight: BTreeMap<i64, bool>,
    /// Seqnos that have exited or self-cancelled but are still above
    /// `drained_to` because a gap below them hasn't closed yet.
    completed: BTreeSet<i64>,
    /// Seqnos whose current (or next) wait must return `Interrupted`.
    interrupted: HashSet<i64>,
    /// Bypass mode (commit monitor only, §4.3): entry never blocks.
    bypass: bool,
}

/// An apply or commit ordering gate (§4.3).
///
/// A ticket at `seqno` with dependency `depends_seqno` becomes ready
/// when every seqno `<= depends_seqno` has drained *and* no seqno below
/// `seqno` that is still in-flight is marked PA-unsafe - a PA-unsafe
/// writeset serializes everything behind it regardless of its own
/// declared dependency.
pub struct OrderingMonitor {
    state: Mutex<State>,
    cv: Condvar,
}

impl OrderingMonitor {
    #[must_use]
    pub fn new(bypass: bool) -> Self {
        Self {
            state: Mutex::new(State {
                drained_to: 0,
                in_flight: BTreeMap::new(),
                completed: BTreeSet::new(),
                interrupted: HashSet::new(),
                bypass,
            }),
            cv: Condvar::new(),
        }
    }

    /// Block until `seqno`'s ticket is ready, then mark it in-flight.
    ///
    /// # Errors
    /// [`MonitorError::Interrupted`] if [`Self::interrupt`] was called
    /// for this seqno before or during the wait; the monitor's state is
    /// left exactly as if the call had never happened.
    pub fn enter(&self, seqno: i64, depends_seqno: i64, pa_unsafe: bool) -> Result<(), MonitorError> {
        let mut g = self.state.lock();
        loop {
            if g.interrupted.remove(&seqno) {
                return Err(MonitorError::Interrupted);
            }
            if g.bypass || self.ready(&g, seqno, depends_seqno) {
                g.in_flight.insert(seqno, pa_unsafe);
                return Ok(());
            }
            self.cv.wait(&mut g);
        }
    }

    fn ready(&self, g: &State, seqno: i64, depends_seqno: i64) -> bool {
        if g.drained_to < depends_seqno {
            return false;
        }
        !g.in_flight.range(..seqno).any(|(_, &unsafe_)| unsafe_)
    }

    /// Mark `seqno` as having exited the monitor, advancing the drain
    /// frontier past it (and any now-contiguous run above it) and
    /// waking waiters to re-check readiness.
    pub fn exit(&self, seqno: i64) {
        let mut g = self.state.lock();
        g.in_flight.remove(&seqno);
        g.completed.insert(seqno);
        self.advance_drain(&mut g);
        self.cv.notify_all();
    }

    /// Record that `seqno` will never enter this monitor - equivalent
    /// to a null-pass so dependants are not blocked on it forever
    /// (§4.3, §4.4 certification-failure cleanup).
    pub fn self_cancel(&self, seqno: i64) {
        let mut g = self.state.lock();
        g.in_flight.remove(&seqno);
        g.completed.insert(seqno);
        self.advance_drain(&mut g);
        self.cv.notify_all();
    }

    fn advance_drain(&self, g: &mut State) {
        while g.completed.remove(&(g.drained_to + 1)) {
            g.drained_to += 1;
        }
    }

    /// Block until every seqno `<= to_seqno` has exited this monitor.
    /// Used before state transfer and reconfiguration (§4.3).
    pub fn drain(&self, to_seqno: i64) {
        let mut g = self.state.lock();
        while g.drained_to < to_seqno {
            self.cv.wait(&mut g);
        }
    }

    /// Abort a current (or future, if it hasn't entered yet) wait for
    /// `seqno` with a distinguished cancellation result, without
    /// otherwise changing the monitor's state (§4.3, §5).
    pub fn interrupt(&self, seqno: i64) {
        let mut g = self.state.lock();
        g.interrupted.insert(seqno);
        self.cv.notify_all();
    }

    #[must_use]
    pub fn drained_to(&self) -> i64 {
        self.state.lock().drained_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_seqno_with_no_dependency_enters_immediately() {
        let m = OrderingMonitor::new(false);
        assert!(m.enter(1, 0, false).is_ok());
    }

    #[test]
    fn blocks_until_dependency_drains() {
        let m = Arc::new(OrderingMonitor::new(false));
        assert!(m.enter(1, 0, false).is_ok());

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || {
            // Depends on seqno 1 having drained.
            m2.enter(2, 1, false).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        assert_eq!(m.drained_to(), 0);
        m.exit(1);
        handle.join().unwrap();
        assert_eq!(m.drained_to(), 1);
    }

    #[test]
    fn pa_unsafe_in_flight_blocks_independent_later_seqno() {
        let m = Arc::new(OrderingMonitor::new(false));
        // seqno 1 is PA-unsafe and still in flight.
        m.enter(1, 0, true).unwrap();

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || {
            // seqno 2 has no real dependency on 1, but must still wait
            // because 1 is in-flight and PA-unsafe.
            m2.enter(2, 0, false).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        m.exit(1);
        handle.join().unwrap();
    }

    #[test]
    fn self_cancel_unblocks_dependants() {
        let m = Arc::new(OrderingMonitor::new(false));
        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || {
            m2.enter(2, 1, false).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        m.self_cancel(1);
        handle.join().unwrap();
        assert_eq!(m.drained_to(), 1);
    }

    #[test]
    fn interrupt_returns_distinguished_error() {
        let m = Arc::new(OrderingMonitor::new(false));
        m.enter(1, 0, false).unwrap(); // never exits, so seqno 2 blocks

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || m2.enter(2, 1, false));

        thread::sleep(Duration::from_millis(20));
        m.interrupt(2);
        let res = handle.join().unwrap();
        assert!(matches!(res, Err(MonitorError::Interrupted)));
    }

    #[test]
    fn drain_waits_for_contiguous_exit() {
        let m = Arc::new(OrderingMonitor::new(false));
        m.enter(1, 0, false).unwrap();
        m.enter(2, 0, false).unwrap();

        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || m2.drain(2));

        thread::sleep(Duration::from_millis(10));
        assert!(!handle.is_finished());
        // Exiting out of order: 2 first doesn't advance the floor past 1.
        m.exit(2);
        thread::sleep(Duration::from_millis(10));
        assert!(!handle.is_finished());
        m.exit(1);
        handle.join().unwrap();
        assert_eq!(m.drained_to(), 2);
    }

    #[test]
    fn bypass_mode_never_blocks() {
        let m = OrderingMonitor::new(true);
        assert!(m.enter(5, 4, false).is_ok());
        assert!(m.enter(1, 0, false).is_ok());
    }
}
