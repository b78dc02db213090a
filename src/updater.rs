// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: per-device update state machine.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Drives one firmware device through the DSP0267 update sequence.
//!
//! The updater holds at most one outbound request at a time and otherwise
//! reacts to correlated responses, FD-initiated requests and timer expiry.
//! Every transition out of a response handler goes through a deferred
//! [`Step`] so the handler frame unwinds (and its instance id is freed)
//! before the next request is registered.

use log::{debug, error, info, warn};
use num_traits::FromPrimitive;
use std::collections::{BTreeMap, HashMap};

use mctp::Eid;

use crate::event::{EventQueue, Step, Token};
use crate::instance_id::InstanceIdDb;
use crate::manager::{RunProgress, UpdateOptions};
use crate::pkg::{ComponentImage, FwDeviceRecord, Package};
use crate::proto::{
    parse_exact, transfer_flag, ActivateFirmwareReq, ActivateFirmwareResp,
    ApplyCompleteReq, Cmd, PassComponentTableReq, PassComponentTableResp,
    PldmRequest, PldmResponse, RequestFirmwareDataReq, RequestUpdateReq,
    RequestUpdateResp, TransferCompleteReq, TransferResult,
    UpdateComponentReq, UpdateComponentResp, VerifyCompleteReq, VerifyResult,
    NOT_ACTIVATE_SELF_CONTAINED, PLDM_FW_MIN_OUTSTANDING_REQ,
};
use crate::requester::{Handler, Origin};
use crate::{
    CCode, FwCode, Transport, PLDM_FW_BASELINE_TRANSFER, PLDM_TYPE_FW,
};

/// Shared services a device updater borrows for the duration of one
/// callback. The update manager owns all of them.
pub(crate) struct UpdaterCtx<'a, T: Transport> {
    pub handler: &'a mut Handler<T>,
    pub iids: &'a mut InstanceIdDb,
    pub events: &'a mut EventQueue,
    pub package: &'a Package,
    pub progress: &'a mut RunProgress,
    pub options: &'a UpdateOptions,
}

/// Update sequence state, named for the dialog currently in progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdaterState {
    /// Not started
    Idle,
    /// RequestUpdate sent, awaiting the response
    RequestUpdate,
    /// PassComponentTable sent for the current component
    PassComponentTable,
    /// UpdateComponent sent for the current component
    UpdateComponent,
    /// FD is transferring the current component via RequestFirmwareData
    Download,
    /// Awaiting VerifyComplete from the FD
    Verify,
    /// Awaiting ApplyComplete from the FD
    Apply,
    /// CancelUpdateComponent sent for the current component
    CancelComponent,
    /// ActivateFirmware sent
    Activate,
    /// Run finished; completion already reported
    Done(bool),
}

/// Update state machine for a single firmware device
pub struct DeviceUpdater {
    eid: Eid,
    record: usize,
    classification_indices: HashMap<(u16, u16), u8>,
    max_transfer_size: u32,
    state: UpdaterState,
    component_index: usize,
    component_status: BTreeMap<usize, bool>,
    pending_step: Option<Token>,
    fw_data_timer: Option<Token>,
    transfer_started: bool,
}

impl DeviceUpdater {
    /// An idle updater for the device at `eid`, updating from
    /// `package.devices[record]`.
    pub(crate) fn new(
        eid: Eid,
        record: usize,
        classification_indices: HashMap<(u16, u16), u8>,
        max_transfer_size: u32,
    ) -> Self {
        Self {
            eid,
            record,
            classification_indices,
            max_transfer_size: max_transfer_size
                .max(PLDM_FW_BASELINE_TRANSFER),
            state: UpdaterState::Idle,
            component_index: 0,
            component_status: BTreeMap::new(),
            pending_step: None,
            fw_data_timer: None,
            transfer_started: false,
        }
    }

    /// Current state, for progress reporting
    pub fn state(&self) -> UpdaterState {
        self.state
    }

    fn active(&self) -> bool {
        !matches!(self.state, UpdaterState::Idle | UpdaterState::Done(_))
    }

    fn fw_record<'p>(&self, pkg: &'p Package) -> &'p FwDeviceRecord {
        &pkg.devices[self.record]
    }

    fn num_components(&self, pkg: &Package) -> usize {
        self.fw_record(pkg).applicable_components.len()
    }

    fn component<'p>(&self, pkg: &'p Package) -> &'p ComponentImage {
        let rec = self.fw_record(pkg);
        &pkg.components[rec.applicable_components[self.component_index]]
    }

    fn classification_index(&self, comp: &ComponentImage) -> u8 {
        match self.classification_indices.get(&comp.key()) {
            Some(i) => *i,
            None => {
                error!(
                    "{}: no classification index for component \
                     {:04x}:{:04x}",
                    self.eid, comp.classification, comp.identifier
                );
                0
            }
        }
    }

    fn defer<T: Transport>(&mut self, ctx: &mut UpdaterCtx<T>, step: Step) {
        self.pending_step = Some(ctx.events.defer(self.eid, step));
    }

    fn begin_cancel<T: Transport>(&mut self, ctx: &mut UpdaterCtx<T>) {
        self.stop_fw_data_timer(ctx);
        self.component_status.insert(self.component_index, false);
        self.defer(ctx, Step::CancelUpdateComponent);
    }

    fn arm_fw_data_timer<T: Transport>(&mut self, ctx: &mut UpdaterCtx<T>) {
        if let Some(t) = self.fw_data_timer.take() {
            ctx.events.stop_timer(t);
        }
        self.fw_data_timer = Some(
            ctx.events
                .start_timer(self.eid, ctx.options.update_timeout_millis),
        );
    }

    fn stop_fw_data_timer<T: Transport>(&mut self, ctx: &mut UpdaterCtx<T>) {
        if let Some(t) = self.fw_data_timer.take() {
            ctx.events.stop_timer(t);
        }
    }

    /// Report the run result exactly once and park the state machine
    fn complete<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        success: bool,
    ) {
        if matches!(self.state, UpdaterState::Done(_)) {
            return;
        }
        self.stop_fw_data_timer(ctx);
        self.pending_step = None;
        self.state = UpdaterState::Done(success);
        ctx.progress.update_device_completion(self.eid, success);
    }

    /// Begin the update: send RequestUpdate
    pub(crate) fn start<T: Transport>(&mut self, ctx: &mut UpdaterCtx<T>) {
        if self.state != UpdaterState::Idle {
            warn!("{}: update already started", self.eid);
            return;
        }
        self.send_request_update(ctx);
    }

    /// Run a deferred step queued by an earlier callback
    pub(crate) fn run_step<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        token: Token,
        step: Step,
    ) {
        if self.pending_step != Some(token) {
            debug!("{}: stale deferred step {step:?}", self.eid);
            return;
        }
        self.pending_step = None;
        if matches!(self.state, UpdaterState::Done(_)) {
            return;
        }
        match step {
            Step::PassComponentTable(index) => {
                self.send_pass_component_table(ctx, index)
            }
            Step::UpdateComponent(index) => {
                self.send_update_component(ctx, index)
            }
            Step::ActivateFirmware => self.send_activate_firmware(ctx),
            Step::CancelUpdateComponent => self.send_cancel_component(ctx),
        }
    }

    /// Dispatch a correlated response, or its absence after a timeout
    pub(crate) fn handle_response<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        resp: Option<&PldmResponse>,
    ) {
        match self.state {
            UpdaterState::RequestUpdate => self.request_update_resp(ctx, resp),
            UpdaterState::PassComponentTable => {
                self.pass_component_resp(ctx, resp)
            }
            UpdaterState::UpdateComponent => {
                self.update_component_resp(ctx, resp)
            }
            UpdaterState::CancelComponent => {
                self.cancel_component_resp(ctx, resp)
            }
            UpdaterState::Activate => self.activate_resp(ctx, resp),
            state => {
                warn!("{}: unexpected response in state {state:?}", self.eid)
            }
        }
    }

    /// Expiry of the firmware data timer: the FD stopped requesting data
    pub(crate) fn on_fw_data_timeout<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        token: Token,
    ) {
        if self.fw_data_timer != Some(token) {
            return;
        }
        self.fw_data_timer = None;
        error!(
            "{}: timed out waiting for firmware data requests, component {}",
            self.eid, self.component_index
        );
        self.begin_cancel(ctx);
    }

    fn send_request_update<T: Transport>(&mut self, ctx: &mut UpdaterCtx<T>) {
        let rec = self.fw_record(ctx.package);
        let req = RequestUpdateReq {
            max_transfer_size: self.max_transfer_size,
            num_components: rec.applicable_components.len() as u16,
            max_outstanding: PLDM_FW_MIN_OUTSTANDING_REQ,
            package_data_len: rec.package_data.len() as u16,
            version: rec.version.clone(),
        };

        let iid = match ctx.iids.next(self.eid) {
            Ok(iid) => iid,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        let payload = match req.encode() {
            Ok(p) => p,
            Err(e) => {
                ctx.iids.free(self.eid, iid);
                error!("{}: encoding RequestUpdate failed: {e}", self.eid);
                return;
            }
        };
        if let Err(e) = ctx.handler.register(
            self.eid,
            iid,
            PLDM_TYPE_FW,
            Cmd::RequestUpdate as u8,
            payload,
            Origin::FwUpdate,
        ) {
            ctx.iids.free(self.eid, iid);
            error!("{}: sending RequestUpdate failed: {e}", self.eid);
            return;
        }
        self.state = UpdaterState::RequestUpdate;
    }

    fn request_update_resp<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        resp: Option<&PldmResponse>,
    ) {
        let Some(resp) = resp else {
            error!("{}: no response for RequestUpdate", self.eid);
            self.complete(ctx, false);
            return;
        };
        if resp.cc != 0 {
            error!(
                "{}: RequestUpdate failed, completion code 0x{:02x}",
                self.eid, resp.cc
            );
            self.complete(ctx, false);
            return;
        }
        let r = match parse_exact(
            &resp.data,
            RequestUpdateResp::parse,
            "RequestUpdate response",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        // Optional FD metadata and package data stages are not used
        debug!(
            "{}: in update mode, fd_meta_data_len {} will_send_pkg_data {}",
            self.eid, r.fd_meta_data_len, r.fd_will_send_pkg_data
        );

        self.defer(ctx, Step::PassComponentTable(self.component_index));
    }

    fn send_pass_component_table<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        index: usize,
    ) {
        self.component_index = index;
        let n = self.num_components(ctx.package);
        let comp = self.component(ctx.package);
        let req = PassComponentTableReq {
            transfer_flag: transfer_flag(index, n),
            classification: comp.classification,
            identifier: comp.identifier,
            classification_index: self.classification_index(comp),
            comparison_stamp: comp.comparison_stamp,
            version: comp.version.clone(),
        };

        let iid = match ctx.iids.next(self.eid) {
            Ok(iid) => iid,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        let payload = match req.encode() {
            Ok(p) => p,
            Err(e) => {
                ctx.iids.free(self.eid, iid);
                error!(
                    "{}: encoding PassComponentTable failed: {e}",
                    self.eid
                );
                return;
            }
        };
        if let Err(e) = ctx.handler.register(
            self.eid,
            iid,
            PLDM_TYPE_FW,
            Cmd::PassComponentTable as u8,
            payload,
            Origin::FwUpdate,
        ) {
            ctx.iids.free(self.eid, iid);
            error!("{}: sending PassComponentTable failed: {e}", self.eid);
            return;
        }
        self.state = UpdaterState::PassComponentTable;
    }

    fn pass_component_resp<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        resp: Option<&PldmResponse>,
    ) {
        let Some(resp) = resp else {
            error!("{}: no response for PassComponentTable", self.eid);
            self.complete(ctx, false);
            return;
        };
        if resp.cc != 0 {
            error!(
                "{}: PassComponentTable failed, completion code 0x{:02x}",
                self.eid, resp.cc
            );
            self.complete(ctx, false);
            return;
        }
        let r = match parse_exact(
            &resp.data,
            PassComponentTableResp::parse,
            "PassComponentTable response",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        if r.comp_response != 0 {
            warn!(
                "{}: component {} not accepted, response code 0x{:02x}",
                self.eid, self.component_index, r.comp_response_code
            );
            if ctx.options.strict_component_response {
                self.complete(ctx, false);
                return;
            }
        }

        if self.component_index + 1 == self.num_components(ctx.package) {
            self.component_index = 0;
            self.defer(ctx, Step::UpdateComponent(self.component_index));
        } else {
            self.component_index += 1;
            self.defer(ctx, Step::PassComponentTable(self.component_index));
        }
    }

    fn send_update_component<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        index: usize,
    ) {
        self.component_index = index;
        let comp = self.component(ctx.package);
        let req = UpdateComponentReq {
            classification: comp.classification,
            identifier: comp.identifier,
            classification_index: self.classification_index(comp),
            comparison_stamp: comp.comparison_stamp,
            size: comp.size,
            update_option_flags: comp.update_option_flags(),
            version: comp.version.clone(),
        };

        let iid = match ctx.iids.next(self.eid) {
            Ok(iid) => iid,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        let payload = match req.encode() {
            Ok(p) => p,
            Err(e) => {
                ctx.iids.free(self.eid, iid);
                error!("{}: encoding UpdateComponent failed: {e}", self.eid);
                return;
            }
        };
        if let Err(e) = ctx.handler.register(
            self.eid,
            iid,
            PLDM_TYPE_FW,
            Cmd::UpdateComponent as u8,
            payload,
            Origin::FwUpdate,
        ) {
            ctx.iids.free(self.eid, iid);
            error!("{}: sending UpdateComponent failed: {e}", self.eid);
            return;
        }
        self.transfer_started = false;
        self.state = UpdaterState::UpdateComponent;
    }

    fn update_component_resp<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        resp: Option<&PldmResponse>,
    ) {
        let Some(resp) = resp else {
            error!("{}: no response for UpdateComponent", self.eid);
            self.complete(ctx, false);
            return;
        };
        if resp.cc != 0 {
            error!(
                "{}: UpdateComponent failed, completion code 0x{:02x}",
                self.eid, resp.cc
            );
            self.complete(ctx, false);
            return;
        }
        let r = match parse_exact(
            &resp.data,
            UpdateComponentResp::parse,
            "UpdateComponent response",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        debug!(
            "{}: component {} accepted, compatibility 0x{:02x}/0x{:02x}, \
             time before data request {}s",
            self.eid,
            self.component_index,
            r.comp_compatibility_resp,
            r.comp_compatibility_resp_code,
            r.time_before_req_fw_data
        );

        // The FD drives the transfer from here
        self.state = UpdaterState::Download;
    }

    /// Handle an FD-initiated request, producing the response to send
    pub(crate) fn handle_request<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        req: &PldmRequest,
    ) -> PldmResponse {
        if !self.active() {
            warn!(
                "{}: command 0x{:02x} with no update in progress",
                self.eid, req.cmd
            );
            return req.response(FwCode::COMMAND_NOT_EXPECTED as u8);
        }
        match Cmd::from_u8(req.cmd) {
            Some(Cmd::RequestFirmwareData) => self.request_fw_data(ctx, req),
            Some(Cmd::TransferComplete) => self.transfer_complete(ctx, req),
            Some(Cmd::VerifyComplete) => self.verify_complete(ctx, req),
            Some(Cmd::ApplyComplete) => self.apply_complete(ctx, req),
            _ => {
                warn!(
                    "{}: unexpected command 0x{:02x} from device",
                    self.eid, req.cmd
                );
                req.response(CCode::ERROR_UNSUPPORTED_PLDM_CMD as u8)
            }
        }
    }

    fn request_fw_data<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        req: &PldmRequest,
    ) -> PldmResponse {
        let r = match parse_exact(
            &req.data,
            RequestFirmwareDataReq::parse,
            "RequestFirmwareData request",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return req.response(CCode::ERROR_INVALID_DATA as u8);
            }
        };
        if self.state != UpdaterState::Download {
            warn!(
                "{}: firmware data request in state {:?}",
                self.eid, self.state
            );
            return req.response(FwCode::COMMAND_NOT_EXPECTED as u8);
        }

        let comp = self.component(ctx.package);
        debug!(
            "{}: firmware data request offset {} length {}",
            self.eid, r.offset, r.length
        );

        if r.length < PLDM_FW_BASELINE_TRANSFER
            || r.length > self.max_transfer_size
        {
            return req.response(FwCode::INVALID_TRANSFER_LENGTH as u8);
        }
        let end = r.offset as u64 + r.length as u64;
        if end > comp.size as u64 + PLDM_FW_BASELINE_TRANSFER as u64 {
            return req.response(FwCode::DATA_OUT_OF_RANGE as u8);
        }

        // Zero-filled tail past the image end
        let pad = end.saturating_sub(comp.size as u64) as usize;
        let mut image = vec![0u8; r.length as usize];
        let data_len = image.len() - pad;
        if let Err(e) =
            ctx.package
                .read_component(comp, r.offset as u64, &mut image[..data_len])
        {
            error!("{}: package read failed: {e}", self.eid);
            return req.response(CCode::ERROR as u8);
        }

        if !self.transfer_started {
            if r.offset != 0 {
                warn!(
                    "{}: first data request at offset {}, not 0",
                    self.eid, r.offset
                );
            }
            self.transfer_started = true;
        }
        self.arm_fw_data_timer(ctx);

        req.response_data(CCode::SUCCESS as u8, image)
    }

    fn transfer_complete<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        req: &PldmRequest,
    ) -> PldmResponse {
        // The transfer is over either way; stop the timer before replying
        self.stop_fw_data_timer(ctx);

        let r = match parse_exact(
            &req.data,
            TransferCompleteReq::parse,
            "TransferComplete request",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return req.response(CCode::ERROR_INVALID_DATA as u8);
            }
        };

        let comp = self.component(ctx.package);
        if r.result == TransferResult::Success {
            info!(
                "{}: component {} transfer complete",
                self.eid, comp.version
            );
            self.state = UpdaterState::Verify;
        } else {
            error!(
                "{}: component {} transfer failed: {:?}",
                self.eid, comp.version, r.result
            );
            self.begin_cancel(ctx);
        }
        req.response(CCode::SUCCESS as u8)
    }

    fn verify_complete<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        req: &PldmRequest,
    ) -> PldmResponse {
        let r = match parse_exact(
            &req.data,
            VerifyCompleteReq::parse,
            "VerifyComplete request",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return req.response(CCode::ERROR_INVALID_DATA as u8);
            }
        };

        let comp = self.component(ctx.package);
        if r.result == VerifyResult::Success {
            info!(
                "{}: component {} verification complete",
                self.eid, comp.version
            );
            self.state = UpdaterState::Apply;
        } else {
            error!(
                "{}: component {} verification failed: {:?}",
                self.eid, comp.version, r.result
            );
            self.begin_cancel(ctx);
        }
        req.response(CCode::SUCCESS as u8)
    }

    fn apply_complete<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        req: &PldmRequest,
    ) -> PldmResponse {
        let r = match parse_exact(
            &req.data,
            ApplyCompleteReq::parse,
            "ApplyComplete request",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return req.response(CCode::ERROR_INVALID_DATA as u8);
            }
        };

        let comp = self.component(ctx.package);
        if r.result.is_success() {
            info!("{}: component {} apply complete", self.eid, comp.version);
            ctx.progress.update_activation_progress();
            self.component_status.insert(self.component_index, true);

            if self.component_index + 1 == self.num_components(ctx.package) {
                self.component_index = 0;
                self.component_status.clear();
                self.defer(ctx, Step::ActivateFirmware);
            } else {
                self.component_index += 1;
                self.component_status.insert(self.component_index, true);
                self.defer(ctx, Step::UpdateComponent(self.component_index));
            }
        } else {
            error!(
                "{}: component {} apply failed: {:?}",
                self.eid, comp.version, r.result
            );
            self.begin_cancel(ctx);
        }
        req.response(CCode::SUCCESS as u8)
    }

    fn send_activate_firmware<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
    ) {
        let req = ActivateFirmwareReq {
            self_contained_activation: NOT_ACTIVATE_SELF_CONTAINED,
        };

        let iid = match ctx.iids.next(self.eid) {
            Ok(iid) => iid,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        if let Err(e) = ctx.handler.register(
            self.eid,
            iid,
            PLDM_TYPE_FW,
            Cmd::ActivateFirmware as u8,
            req.encode(),
            Origin::FwUpdate,
        ) {
            ctx.iids.free(self.eid, iid);
            error!("{}: sending ActivateFirmware failed: {e}", self.eid);
            return;
        }
        self.state = UpdaterState::Activate;
    }

    fn activate_resp<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        resp: Option<&PldmResponse>,
    ) {
        let Some(resp) = resp else {
            error!("{}: no response for ActivateFirmware", self.eid);
            self.complete(ctx, false);
            return;
        };
        if resp.cc != 0 {
            error!(
                "{}: ActivateFirmware failed, completion code 0x{:02x}",
                self.eid, resp.cc
            );
            self.complete(ctx, false);
            return;
        }
        let r = match parse_exact(
            &resp.data,
            ActivateFirmwareResp::parse,
            "ActivateFirmware response",
        ) {
            Ok(r) => r,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        debug!(
            "{}: activation requested, estimated time {}s",
            self.eid, r.estimated_time
        );
        self.complete(ctx, true);
    }

    fn send_cancel_component<T: Transport>(&mut self, ctx: &mut UpdaterCtx<T>) {
        let iid = match ctx.iids.next(self.eid) {
            Ok(iid) => iid,
            Err(e) => {
                error!("{}: {e}", self.eid);
                return;
            }
        };
        if let Err(e) = ctx.handler.register(
            self.eid,
            iid,
            PLDM_TYPE_FW,
            Cmd::CancelUpdateComponent as u8,
            Vec::new(),
            Origin::FwUpdate,
        ) {
            ctx.iids.free(self.eid, iid);
            error!(
                "{}: sending CancelUpdateComponent failed: {e}",
                self.eid
            );
            return;
        }
        self.state = UpdaterState::CancelComponent;
    }

    fn cancel_component_resp<T: Transport>(
        &mut self,
        ctx: &mut UpdaterCtx<T>,
        resp: Option<&PldmResponse>,
    ) {
        let Some(resp) = resp else {
            error!("{}: no response for CancelUpdateComponent", self.eid);
            self.complete(ctx, false);
            return;
        };
        if resp.cc != 0 {
            error!(
                "{}: CancelUpdateComponent for component {} failed, \
                 completion code 0x{:02x}",
                self.eid, self.component_index, resp.cc
            );
            self.complete(ctx, false);
            return;
        }

        if self.component_index + 1 == self.num_components(ctx.package) {
            // Last component cancelled: activate if anything applied
            if self.component_status.values().any(|ok| *ok) {
                self.component_index = 0;
                self.component_status.clear();
                self.defer(ctx, Step::ActivateFirmware);
            } else {
                self.complete(ctx, false);
            }
        } else {
            self.component_index += 1;
            self.component_status.insert(self.component_index, true);
            self.defer(ctx, Step::UpdateComponent(self.component_index));
        }
    }
}
