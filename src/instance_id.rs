// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: instance id allocation.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Per-endpoint PLDM instance id allocation.
//!
//! Each EID has 32 instance ids (0..=31) correlating a request with its
//! response. Allocation rotates so a stale response for a recently freed id
//! is unlikely to match a new request.

use log::debug;
use mctp::Eid;

use crate::{Error, Result};

const NUM_INSTANCE_IDS: u8 = 32;

#[derive(Debug, Default, Clone, Copy)]
struct Pool {
    used: u32,
    last: u8,
}

/// Allocator for PLDM instance ids, one pool per EID
pub struct InstanceIdDb {
    pools: [Pool; 256],
}

impl Default for InstanceIdDb {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceIdDb {
    /// An allocator with all ids free
    pub fn new() -> Self {
        Self { pools: [Pool::default(); 256] }
    }

    /// Allocate the next free instance id for `eid`.
    ///
    /// Fails with [`Error::InstanceIdsExhausted`] when all 32 are in use.
    pub fn next(&mut self, eid: Eid) -> Result<u8> {
        let pool = &mut self.pools[eid.0 as usize];
        for n in 1..=NUM_INSTANCE_IDS {
            let iid = (pool.last + n) % NUM_INSTANCE_IDS;
            if pool.used & (1 << iid) == 0 {
                pool.used |= 1 << iid;
                pool.last = iid;
                return Ok(iid);
            }
        }
        Err(Error::InstanceIdsExhausted(eid.0))
    }

    /// Release an instance id. Idempotent.
    pub fn free(&mut self, eid: Eid, iid: u8) {
        if iid >= NUM_INSTANCE_IDS {
            debug!("free of out-of-range instance id {iid} for {eid}");
            return;
        }
        self.pools[eid.0 as usize].used &= !(1 << iid);
    }

    /// Number of ids currently allocated for `eid`
    pub fn in_use(&self, eid: Eid) -> u32 {
        self.pools[eid.0 as usize].used.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EID: Eid = Eid(9);

    #[test]
    fn rotation() {
        let mut db = InstanceIdDb::new();
        let a = db.next(EID).unwrap();
        db.free(EID, a);
        let b = db.next(EID).unwrap();
        // freed id is not immediately reused
        assert_ne!(a, b);
        assert!(b < 32);
    }

    #[test]
    fn exhaustion() {
        let mut db = InstanceIdDb::new();
        for _ in 0..32 {
            db.next(EID).unwrap();
        }
        assert!(matches!(
            db.next(EID),
            Err(Error::InstanceIdsExhausted(9))
        ));

        // another endpoint is unaffected
        db.next(Eid(10)).unwrap();

        db.free(EID, 13);
        assert_eq!(db.next(EID).unwrap(), 13);
    }

    #[test]
    fn free_idempotent() {
        let mut db = InstanceIdDb::new();
        let a = db.next(EID).unwrap();
        let b = db.next(EID).unwrap();
        db.free(EID, a);
        db.free(EID, a);
        // double free must not release b
        assert_eq!(db.in_use(EID), 1);
        db.free(EID, b);
        assert_eq!(db.in_use(EID), 0);
        // out of range is ignored
        db.free(EID, 77);
    }

    #[test]
    fn accounting() {
        let mut db = InstanceIdDb::new();
        let mut held = Vec::new();
        for _ in 0..100 {
            held.push(db.next(EID).unwrap());
            if held.len() == 3 {
                for iid in held.drain(..) {
                    db.free(EID, iid);
                }
            }
        }
        for iid in held {
            assert!(iid < 32);
            db.free(EID, iid);
        }
        assert_eq!(db.in_use(EID), 0);
    }
}
