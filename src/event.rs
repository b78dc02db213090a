// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: deferred work and timers.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Single-threaded event queue: one-shot deferred steps and one-shot timers.
//!
//! Phase transitions that follow a response handler are queued here rather
//! than run inline, so the handler frame (and its instance id) fully unwinds
//! before the next request is registered. The queue holds plain data; the
//! update manager interprets it on the next [`drain`](EventQueue::pop_step).
//!
//! Time is an external `now_millis` timestamp, in the same style as a
//! transport stack's `update(now)` entry point. The queue never reads a
//! clock of its own.

use std::collections::VecDeque;

use mctp::Eid;

/// A deferred state machine step for one device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// Send PassComponentTable for the indexed component
    PassComponentTable(usize),
    /// Send UpdateComponent for the indexed component
    UpdateComponent(usize),
    /// Send ActivateFirmware
    ActivateFirmware,
    /// Send CancelUpdateComponent for the current component
    CancelUpdateComponent,
}

/// Token identifying a queued step or running timer.
///
/// The owner keeps the token of its latest deferral; queue entries with a
/// token the owner no longer holds are stale and are skipped, which is how
/// replacing a deferral cancels the previous one.
pub type Token = u64;

#[derive(Debug)]
struct Deferred {
    token: Token,
    eid: Eid,
    step: Step,
}

#[derive(Debug)]
struct Timer {
    token: Token,
    eid: Eid,
    deadline: u64,
}

/// Deferred steps and timers for the update run
#[derive(Debug, Default)]
pub struct EventQueue {
    now: u64,
    next_token: Token,
    steps: VecDeque<Deferred>,
    timers: Vec<Timer>,
}

impl EventQueue {
    /// An empty queue with the clock at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock. Never steps backwards.
    pub fn set_now(&mut self, now_millis: u64) {
        if now_millis > self.now {
            self.now = now_millis;
        }
    }

    /// Timestamp of the latest `set_now`
    pub fn now(&self) -> u64 {
        self.now
    }

    fn token(&mut self) -> Token {
        self.next_token += 1;
        self.next_token
    }

    /// Queue a one-shot step for `eid`
    pub fn defer(&mut self, eid: Eid, step: Step) -> Token {
        let token = self.token();
        self.steps.push_back(Deferred { token, eid, step });
        token
    }

    /// Dequeue the oldest step
    pub fn pop_step(&mut self) -> Option<(Token, Eid, Step)> {
        self.steps.pop_front().map(|d| (d.token, d.eid, d.step))
    }

    /// Start a one-shot timer expiring `duration_millis` from now
    pub fn start_timer(&mut self, eid: Eid, duration_millis: u64) -> Token {
        let token = self.token();
        self.timers.push(Timer {
            token,
            eid,
            deadline: self.now.saturating_add(duration_millis),
        });
        token
    }

    /// Cancel a running timer. A no-op for expired or unknown tokens.
    pub fn stop_timer(&mut self, token: Token) {
        self.timers.retain(|t| t.token != token);
    }

    /// Remove and return timers whose deadline has passed
    pub fn take_expired_timers(&mut self) -> Vec<(Token, Eid)> {
        let now = self.now;
        let mut fired = Vec::new();
        self.timers.retain(|t| {
            if t.deadline <= now {
                fired.push((t.token, t.eid));
                false
            } else {
                true
            }
        });
        fired
    }

    /// Earliest timer deadline, absolute milliseconds
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// True when no steps are queued
    pub fn is_idle(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EID: Eid = Eid(8);

    #[test]
    fn defer_fifo() {
        let mut q = EventQueue::new();
        let t1 = q.defer(EID, Step::PassComponentTable(0));
        let t2 = q.defer(Eid(9), Step::ActivateFirmware);
        assert_ne!(t1, t2);

        let (tok, eid, step) = q.pop_step().unwrap();
        assert_eq!((tok, eid, step), (t1, EID, Step::PassComponentTable(0)));
        let (tok, eid, step) = q.pop_step().unwrap();
        assert_eq!((tok, eid, step), (t2, Eid(9), Step::ActivateFirmware));
        assert!(q.pop_step().is_none());
    }

    #[test]
    fn timer_expiry() {
        let mut q = EventQueue::new();
        q.set_now(1000);
        let t = q.start_timer(EID, 500);
        assert_eq!(q.next_deadline(), Some(1500));

        q.set_now(1499);
        assert!(q.take_expired_timers().is_empty());

        q.set_now(1500);
        assert_eq!(q.take_expired_timers(), vec![(t, EID)]);
        // one-shot
        q.set_now(9999);
        assert!(q.take_expired_timers().is_empty());
    }

    #[test]
    fn timer_stop() {
        let mut q = EventQueue::new();
        let t = q.start_timer(EID, 100);
        q.stop_timer(t);
        q.set_now(1000);
        assert!(q.take_expired_timers().is_empty());
        assert_eq!(q.next_deadline(), None);
    }

    #[test]
    fn clock_monotonic() {
        let mut q = EventQueue::new();
        q.set_now(50);
        q.set_now(20);
        assert_eq!(q.now(), 50);
    }
}
