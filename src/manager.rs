// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: update manager and inbound dispatch.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Fan-out of one update package across its target devices.
//!
//! The manager owns the request scheduler, the instance id allocator, the
//! event queue, the package and one [`DeviceUpdater`] per target. The
//! embedding daemon feeds inbound PLDM messages to
//! [`handle_message`](UpdateManager::handle_message) and periodically calls
//! [`update`](UpdateManager::update) with the current time; everything runs
//! on that single thread.

use log::{debug, error, info, warn};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use mctp::Eid;

use crate::bridge::SensorEventBridge;
use crate::event::EventQueue;
use crate::instance_id::InstanceIdDb;
use crate::pkg::Package;
use crate::proto::{parse_message, PldmMessage, PldmRequest, PldmResponse};
use crate::requester::{Handler, Origin};
use crate::updater::{DeviceUpdater, UpdaterCtx, UpdaterState};
use crate::{
    CCode, Error, FwCode, Result, Transport, PLDM_FW_BASELINE_TRANSFER,
    PLDM_TYPE_FW,
};

/// Tunables for an update run
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Largest firmware data chunk offered to the FD, bytes. Clamped to at
    /// least the 32 byte baseline.
    pub max_transfer_size: u32,
    /// Deadline for the FD's next RequestFirmwareData, milliseconds
    pub update_timeout_millis: u64,
    /// Deadline for a response to any of our requests, milliseconds
    pub request_timeout_millis: u64,
    /// Fail the device when it rejects a component in PassComponentTable.
    /// Off by default: the component response code is advisory and some
    /// devices report spurious mismatches.
    pub strict_component_response: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            max_transfer_size: 4096,
            update_timeout_millis: 60 * 1000,
            request_timeout_millis: 4800,
            strict_component_response: false,
        }
    }
}

/// Aggregated results of the current activation run
#[derive(Debug, Default)]
pub struct RunProgress {
    completion: BTreeMap<Eid, bool>,
    activation_progress: u64,
}

impl RunProgress {
    /// Record a device's final result. First report wins; a second report
    /// for the same EID is a bug in the caller and is only logged.
    pub(crate) fn update_device_completion(&mut self, eid: Eid, success: bool) {
        match self.completion.entry(eid) {
            Entry::Occupied(_) => {
                warn!("duplicate completion report for {eid}")
            }
            Entry::Vacant(v) => {
                info!(
                    "device {eid} update {}",
                    if success { "complete" } else { "failed" }
                );
                v.insert(success);
            }
        }
    }

    /// One more component applied successfully
    pub(crate) fn update_activation_progress(&mut self) {
        self.activation_progress += 1;
    }

    /// Per-device results so far
    pub fn device_completion(&self) -> &BTreeMap<Eid, bool> {
        &self.completion
    }

    /// Count of successfully applied components, monotonic
    pub fn activation_progress(&self) -> u64 {
        self.activation_progress
    }
}

/// Supervises the device updaters for one firmware package
pub struct UpdateManager<T: Transport> {
    handler: Handler<T>,
    iids: InstanceIdDb,
    events: EventQueue,
    package: Package,
    options: UpdateOptions,
    devices: BTreeMap<Eid, DeviceUpdater>,
    progress: RunProgress,
}

impl<T: Transport> UpdateManager<T> {
    /// A manager for `package`, sending through `transport`
    pub fn new(transport: T, package: Package, options: UpdateOptions) -> Self {
        let mut options = options;
        if options.max_transfer_size < PLDM_FW_BASELINE_TRANSFER {
            warn!(
                "max transfer size {} below baseline, using {}",
                options.max_transfer_size, PLDM_FW_BASELINE_TRANSFER
            );
            options.max_transfer_size = PLDM_FW_BASELINE_TRANSFER;
        }
        let handler = Handler::new(transport, options.request_timeout_millis);
        Self {
            handler,
            iids: InstanceIdDb::new(),
            events: EventQueue::new(),
            package,
            options,
            devices: BTreeMap::new(),
            progress: RunProgress::default(),
        }
    }

    /// Register a target device.
    ///
    /// `record` indexes the package's firmware device records;
    /// `classification_indices` maps `(classification, identifier)` to the
    /// device's component classification index, as learned from its
    /// firmware parameters.
    pub fn add_device(
        &mut self,
        eid: Eid,
        record: usize,
        classification_indices: HashMap<(u16, u16), u8>,
    ) -> Result<()> {
        if record >= self.package.devices.len() {
            return Err(Error::Package(format!(
                "record {record} of {}",
                self.package.devices.len()
            )));
        }
        if self.devices.contains_key(&eid) {
            return Err(Error::Protocol(format!(
                "device {eid} already registered"
            )));
        }
        self.devices.insert(
            eid,
            DeviceUpdater::new(
                eid,
                record,
                classification_indices,
                self.options.max_transfer_size,
            ),
        );
        Ok(())
    }

    /// Start the update on every registered device
    pub fn start_update(&mut self) {
        let eids: Vec<Eid> = self.devices.keys().copied().collect();
        for eid in eids {
            if let Some(dev) = self.devices.get_mut(&eid) {
                let mut ctx = UpdaterCtx {
                    handler: &mut self.handler,
                    iids: &mut self.iids,
                    events: &mut self.events,
                    package: &self.package,
                    progress: &mut self.progress,
                    options: &self.options,
                };
                dev.start(&mut ctx);
            }
        }
    }

    /// Feed one received PLDM message into the dispatcher
    pub fn handle_message(&mut self, eid: Eid, msg: &[u8]) {
        match parse_message(msg) {
            Ok(PldmMessage::Request(req)) => self.handle_fd_request(eid, req),
            Ok(PldmMessage::Response(resp)) => self.handle_response(eid, resp),
            Err(e) => warn!("discarding message from {eid}: {e}"),
        }
    }

    fn handle_fd_request(&mut self, eid: Eid, req: PldmRequest) {
        if req.typ != PLDM_TYPE_FW {
            debug!(
                "request from {eid} for unhandled PLDM type 0x{:02x}",
                req.typ
            );
            self.send_response(
                eid,
                req.response(CCode::ERROR_INVALID_PLDM_TYPE as u8),
            );
            return;
        }
        let Some(dev) = self.devices.get_mut(&eid) else {
            warn!("request from unknown device {eid}");
            self.send_response(
                eid,
                req.response(FwCode::COMMAND_NOT_EXPECTED as u8),
            );
            return;
        };
        let mut ctx = UpdaterCtx {
            handler: &mut self.handler,
            iids: &mut self.iids,
            events: &mut self.events,
            package: &self.package,
            progress: &mut self.progress,
            options: &self.options,
        };
        let resp = dev.handle_request(&mut ctx, &req);
        self.send_response(eid, resp);
    }

    fn send_response(&mut self, eid: Eid, resp: PldmResponse) {
        if let Err(e) = self.handler.respond(eid, &resp) {
            error!("response to {eid} failed: {e}");
        }
    }

    fn handle_response(&mut self, eid: Eid, resp: PldmResponse) {
        let Some(pending) = self.handler.take_response(eid, &resp) else {
            return;
        };
        match pending.origin {
            Origin::FwUpdate => {
                if let Some(dev) = self.devices.get_mut(&eid) {
                    let mut ctx = UpdaterCtx {
                        handler: &mut self.handler,
                        iids: &mut self.iids,
                        events: &mut self.events,
                        package: &self.package,
                        progress: &mut self.progress,
                        options: &self.options,
                    };
                    dev.handle_response(&mut ctx, Some(&resp));
                } else {
                    warn!("response from {eid} with no device updater");
                }
            }
            Origin::PlatformEvent => {
                SensorEventBridge::on_event_response(eid, Some(&resp));
            }
        }
        self.iids.free(eid, pending.iid);
    }

    /// Run deferred work and timeouts.
    ///
    /// `now_millis` is the current timestamp in the same style as would be
    /// used for timer wakeups. Returns the number of milliseconds until the
    /// next deadline, `u32::MAX` if nothing is pending.
    pub fn update(&mut self, now_millis: u64) -> u32 {
        self.events.set_now(now_millis);
        self.handler.set_now(now_millis);

        // Requests the scheduler gave up on complete with a null response
        for pending in self.handler.take_expired(now_millis) {
            match pending.origin {
                Origin::FwUpdate => {
                    if let Some(dev) = self.devices.get_mut(&pending.eid) {
                        let mut ctx = UpdaterCtx {
                            handler: &mut self.handler,
                            iids: &mut self.iids,
                            events: &mut self.events,
                            package: &self.package,
                            progress: &mut self.progress,
                            options: &self.options,
                        };
                        dev.handle_response(&mut ctx, None);
                    }
                }
                Origin::PlatformEvent => {
                    SensorEventBridge::on_event_response(pending.eid, None);
                }
            }
            self.iids.free(pending.eid, pending.iid);
        }

        for (token, eid) in self.events.take_expired_timers() {
            if let Some(dev) = self.devices.get_mut(&eid) {
                let mut ctx = UpdaterCtx {
                    handler: &mut self.handler,
                    iids: &mut self.iids,
                    events: &mut self.events,
                    package: &self.package,
                    progress: &mut self.progress,
                    options: &self.options,
                };
                dev.on_fw_data_timeout(&mut ctx, token);
            }
        }

        while let Some((token, eid, step)) = self.events.pop_step() {
            if let Some(dev) = self.devices.get_mut(&eid) {
                let mut ctx = UpdaterCtx {
                    handler: &mut self.handler,
                    iids: &mut self.iids,
                    events: &mut self.events,
                    package: &self.package,
                    progress: &mut self.progress,
                    options: &self.options,
                };
                dev.run_step(&mut ctx, token, step);
            }
        }

        let next = [self.handler.next_deadline(), self.events.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        match next {
            Some(deadline) => deadline
                .saturating_sub(self.events.now())
                .min(u32::MAX as u64) as u32,
            None => u32::MAX,
        }
    }

    /// Aggregated run results
    pub fn progress(&self) -> &RunProgress {
        &self.progress
    }

    /// True once every registered device has reported a result
    pub fn run_complete(&self) -> bool {
        self.devices
            .keys()
            .all(|eid| self.progress.completion.contains_key(eid))
    }

    /// Overall result: `None` while devices are still running, otherwise
    /// whether every device completed successfully
    pub fn run_succeeded(&self) -> Option<bool> {
        self.run_complete()
            .then(|| self.progress.completion.values().all(|ok| *ok))
    }

    /// State of one device's updater
    pub fn device_state(&self, eid: Eid) -> Option<UpdaterState> {
        self.devices.get(&eid).map(|d| d.state())
    }

    /// The package being applied
    pub fn package(&self) -> &Package {
        &self.package
    }

    /// The request scheduler and instance id allocator, for co-resident
    /// requesters such as the sensor event bridge
    pub fn requester(&mut self) -> (&mut Handler<T>, &mut InstanceIdDb) {
        (&mut self.handler, &mut self.iids)
    }
}
