// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: outbound request scheduling and correlation.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Outbound PLDM request scheduler.
//!
//! Registered requests are matched to their responses by
//! `(eid, instance id, type, command)`. At most a configured number of
//! requests (default one) is on the wire per EID; excess registrations
//! queue FIFO and are transmitted as slots free up.
//!
//! Responses are routed by the [`Origin`] recorded at registration plus the
//! source EID, rather than by per-request closures; the owning state machine
//! dispatches on its own state when the response is handed back.

use log::{debug, error, warn};
use std::collections::VecDeque;

use mctp::Eid;

use crate::proto::{PldmRequest, PldmResponse};
use crate::{Result, Transport};

/// Subsystem that registered a request, used to route its response
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Origin {
    /// Type 5 device updater, keyed by EID
    FwUpdate,
    /// Type 2 platform event sender
    PlatformEvent,
}

/// A registered request awaiting its response
#[derive(Debug, Clone, Copy)]
pub struct Pending {
    /// Destination endpoint
    pub eid: Eid,
    /// Instance id allocated for the dialog
    pub iid: u8,
    /// PLDM type
    pub typ: u8,
    /// Command code
    pub cmd: u8,
    /// Response routing tag
    pub origin: Origin,
    /// Absolute deadline, milliseconds
    pub deadline: u64,
}

struct Queued {
    pending: Pending,
    wire: Vec<u8>,
}

/// Outbound request scheduler and response correlator
pub struct Handler<T: Transport> {
    transport: T,
    inflight: Vec<Pending>,
    backlog: VecDeque<Queued>,
    inflight_per_eid: usize,
    timeout_millis: u64,
    now: u64,
}

impl<T: Transport> Handler<T> {
    /// A scheduler over `transport` with the given response timeout
    pub fn new(transport: T, timeout_millis: u64) -> Self {
        Self {
            transport,
            inflight: Vec::new(),
            backlog: VecDeque::new(),
            inflight_per_eid: 1,
            timeout_millis,
            now: 0,
        }
    }

    /// Advance the scheduler clock, monotonic
    pub fn set_now(&mut self, now_millis: u64) {
        if now_millis > self.now {
            self.now = now_millis;
        }
    }

    fn slots_free(&self, eid: Eid) -> bool {
        self.inflight.iter().filter(|p| p.eid == eid).count()
            < self.inflight_per_eid
    }

    fn transmit(&mut self, entry: Queued) {
        let eid = entry.pending.eid;
        self.inflight.push(entry.pending);
        // A failed send is not fatal here: the entry stays registered and
        // its deadline reports it as unanswered.
        if let Err(e) = self.transport.send(eid, &entry.wire) {
            error!("send to {eid} failed: {e}");
        }
    }

    /// Register an outbound request and transmit it when a slot is free.
    ///
    /// The response (or its absence, once the deadline passes) is later
    /// returned from [`take_response`](Self::take_response) or
    /// [`take_expired`](Self::take_expired), tagged with `origin`.
    pub fn register(
        &mut self,
        eid: Eid,
        iid: u8,
        typ: u8,
        cmd: u8,
        payload: Vec<u8>,
        origin: Origin,
    ) -> Result<()> {
        let wire = PldmRequest::new_data(iid, typ, cmd, payload).to_vec();
        let entry = Queued {
            pending: Pending {
                eid,
                iid,
                typ,
                cmd,
                origin,
                deadline: self.now.saturating_add(self.timeout_millis),
            },
            wire,
        };
        if self.slots_free(eid) {
            self.transmit(entry);
        } else {
            debug!("queueing request 0x{cmd:02x} for busy {eid}");
            self.backlog.push_back(entry);
        }
        Ok(())
    }

    fn kick_backlog(&mut self, eid: Eid) {
        while self.slots_free(eid) {
            let Some(at) =
                self.backlog.iter().position(|q| q.pending.eid == eid)
            else {
                return;
            };
            let mut entry = self.backlog.remove(at).unwrap();
            entry.pending.deadline =
                self.now.saturating_add(self.timeout_millis);
            self.transmit(entry);
        }
    }

    /// Match a received response against the registered requests.
    ///
    /// Returns the pending entry exactly once; an unmatched response is
    /// logged and dropped. Completing an entry transmits the next queued
    /// request for that EID.
    pub fn take_response(
        &mut self,
        eid: Eid,
        resp: &PldmResponse,
    ) -> Option<Pending> {
        let at = self.inflight.iter().position(|p| {
            p.eid == eid
                && p.iid == resp.iid
                && p.typ == resp.typ
                && p.cmd == resp.cmd
        });
        let Some(at) = at else {
            warn!(
                "unmatched response from {eid}: iid {:02x} type {:02x} \
                 cmd {:02x}",
                resp.iid, resp.typ, resp.cmd
            );
            return None;
        };
        let pending = self.inflight.remove(at);
        self.kick_backlog(eid);
        Some(pending)
    }

    /// Remove and return requests whose response deadline has passed
    pub fn take_expired(&mut self, now_millis: u64) -> Vec<Pending> {
        self.set_now(now_millis);
        let now = self.now;
        let mut expired = Vec::new();
        self.inflight.retain(|p| {
            if p.deadline <= now {
                expired.push(*p);
                false
            } else {
                true
            }
        });
        for p in &expired {
            warn!(
                "no response from {} for command 0x{:02x}, iid {:02x}",
                p.eid, p.cmd, p.iid
            );
            self.kick_backlog(p.eid);
        }
        expired
    }

    /// Send a response to an FD-initiated request
    pub fn respond(&mut self, eid: Eid, resp: &PldmResponse) -> Result<()> {
        self.transport.send(eid, &resp.to_vec())
    }

    /// Earliest response deadline, absolute milliseconds
    pub fn next_deadline(&self) -> Option<u64> {
        self.inflight.iter().map(|p| p.deadline).min()
    }

    /// Number of requests on the wire for `eid`
    pub fn inflight(&self, eid: Eid) -> usize {
        self.inflight.iter().filter(|p| p.eid == eid).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PLDM_TYPE_FW;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct RecordingTransport {
        sent: Rc<RefCell<Vec<(Eid, Vec<u8>)>>>,
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, eid: Eid, msg: &[u8]) -> Result<()> {
            self.sent.borrow_mut().push((eid, msg.to_vec()));
            Ok(())
        }
    }

    const EID: Eid = Eid(11);

    fn response(iid: u8, cmd: u8) -> PldmResponse {
        PldmResponse {
            iid,
            typ: PLDM_TYPE_FW,
            cmd,
            cc: 0,
            data: Vec::new(),
        }
    }

    #[test]
    fn single_inflight_per_eid() {
        let t = RecordingTransport::default();
        let sent = t.sent.clone();
        let mut h = Handler::new(t, 1000);

        h.register(EID, 0, PLDM_TYPE_FW, 0x10, vec![], Origin::FwUpdate)
            .unwrap();
        h.register(EID, 1, PLDM_TYPE_FW, 0x13, vec![], Origin::FwUpdate)
            .unwrap();

        // second request held back until the first completes
        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(h.inflight(EID), 1);

        let p = h.take_response(EID, &response(0, 0x10)).unwrap();
        assert_eq!(p.iid, 0);
        assert_eq!(sent.borrow().len(), 2);
        assert_eq!(sent.borrow()[1].1[0], 0x81);
        assert_eq!(h.inflight(EID), 1);
    }

    #[test]
    fn response_matched_once() {
        let t = RecordingTransport::default();
        let mut h = Handler::new(t, 1000);
        h.register(EID, 4, PLDM_TYPE_FW, 0x14, vec![], Origin::FwUpdate)
            .unwrap();

        // wrong command does not match
        assert!(h.take_response(EID, &response(4, 0x10)).is_none());
        assert!(h.take_response(EID, &response(4, 0x14)).is_some());
        // duplicate response is dropped
        assert!(h.take_response(EID, &response(4, 0x14)).is_none());
    }

    #[test]
    fn deadline_expiry() {
        let t = RecordingTransport::default();
        let sent = t.sent.clone();
        let mut h = Handler::new(t, 1000);
        h.set_now(100);
        h.register(EID, 7, PLDM_TYPE_FW, 0x10, vec![], Origin::FwUpdate)
            .unwrap();
        h.register(EID, 8, PLDM_TYPE_FW, 0x13, vec![], Origin::FwUpdate)
            .unwrap();

        assert!(h.take_expired(1099).is_empty());
        let expired = h.take_expired(1100);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].iid, 7);
        // queued request goes out after the expiry
        assert_eq!(sent.borrow().len(), 2);
        assert_eq!(h.inflight(EID), 1);
    }
}
