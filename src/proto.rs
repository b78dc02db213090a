// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: message framing and Type 5 wire codec.
 *
 * Copyright (c) 2024 Code Construct
 */

//! PLDM message framing and the DSP0267 Type 5 command payloads.
//!
//! Requests the UA builds have `encode()`, messages the UA receives have
//! `parse()`. The FD half of each pair is also provided where the test
//! harness acts as the remote device.

use log::debug;
use num_derive::FromPrimitive;

use nom::{
    bytes::complete::take,
    combinator::{all_consuming, map_opt},
    number::complete::{le_u16, le_u32, le_u8},
    sequence::tuple,
    IResult,
};

use crate::{Error, Result};

type VResult<I, O> = IResult<I, O>;

/// ASCII version string type on the wire
pub const PLDM_STR_TYPE_ASCII: u8 = 1;

/// MaximumOutstandingTransferRequests: one at a time
pub const PLDM_FW_MIN_OUTSTANDING_REQ: u8 = 1;

/// SelfContainedActivationRequest: do not activate self-contained components
pub const NOT_ACTIVATE_SELF_CONTAINED: u8 = 0;

/// PLDM Firmware Update commands used by the update agent
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum Cmd {
    RequestUpdate = 0x10,
    PassComponentTable = 0x13,
    UpdateComponent = 0x14,
    RequestFirmwareData = 0x15,
    TransferComplete = 0x16,
    VerifyComplete = 0x17,
    ApplyComplete = 0x18,
    ActivateFirmware = 0x1A,
    CancelUpdateComponent = 0x1C,
}

impl Cmd {
    /// Commands initiated by the firmware device
    pub const fn is_fd(&self) -> bool {
        matches!(
            self,
            Self::RequestFirmwareData
                | Self::TransferComplete
                | Self::VerifyComplete
                | Self::ApplyComplete
        )
    }
}

/// Transfer flag for multi-part table transfers
#[allow(missing_docs)]
#[derive(FromPrimitive, Debug, PartialEq, Copy, Clone)]
#[repr(u8)]
pub enum TransferFlag {
    Start = 0x01,
    Middle = 0x02,
    End = 0x04,
    StartAndEnd = 0x05,
}

/// Returns the transfer flag for entry `idx` of a table of `len` entries
pub fn transfer_flag(idx: usize, len: usize) -> u8 {
    let mut flag: u8 = 0;
    if idx == 0 {
        flag |= TransferFlag::Start as u8;
    }
    if idx + 1 == len {
        flag |= TransferFlag::End as u8;
    }
    if flag == 0 {
        flag = TransferFlag::Middle as u8;
    }
    flag
}

/// Transfer Result codes for TransferComplete
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq)]
#[non_exhaustive]
pub enum TransferResult {
    Success,
    Corrupt,
    VersionMismatch,
    Aborted,
    Timeout,
    GenericError,
    Other(u8),
}

impl From<u8> for TransferResult {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::Corrupt,
            0x02 => Self::VersionMismatch,
            0x03 => Self::Aborted,
            0x09 => Self::Timeout,
            0x0a => Self::GenericError,
            v => Self::Other(v),
        }
    }
}

impl From<TransferResult> for u8 {
    fn from(v: TransferResult) -> u8 {
        match v {
            TransferResult::Success => 0x00,
            TransferResult::Corrupt => 0x01,
            TransferResult::VersionMismatch => 0x02,
            TransferResult::Aborted => 0x03,
            TransferResult::Timeout => 0x09,
            TransferResult::GenericError => 0x0a,
            TransferResult::Other(v) => v,
        }
    }
}

/// Verify Result codes for VerifyComplete
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq)]
#[non_exhaustive]
pub enum VerifyResult {
    Success,
    Failure,
    VersionMismatch,
    SecurityChecksFailed,
    IncompleteImage,
    Timeout,
    GenericError,
    Other(u8),
}

impl From<u8> for VerifyResult {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::Failure,
            0x02 => Self::VersionMismatch,
            0x03 => Self::SecurityChecksFailed,
            0x04 => Self::IncompleteImage,
            0x09 => Self::Timeout,
            0x0a => Self::GenericError,
            v => Self::Other(v),
        }
    }
}

/// Apply Result codes for ApplyComplete
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq)]
#[non_exhaustive]
pub enum ApplyResult {
    Success,
    SuccessModActivation,
    FailedMemoryWrite,
    Timeout,
    GenericError,
    Other(u8),
}

impl From<u8> for ApplyResult {
    fn from(v: u8) -> Self {
        match v {
            0x00 => Self::Success,
            0x01 => Self::SuccessModActivation,
            0x02 => Self::FailedMemoryWrite,
            0x09 => Self::Timeout,
            0x0a => Self::GenericError,
            v => Self::Other(v),
        }
    }
}

impl ApplyResult {
    /// Success with a modified activation method still applies cleanly
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::SuccessModActivation)
    }
}

/// A PLDM request message, header fields plus payload
#[derive(Debug, Clone, PartialEq)]
pub struct PldmRequest {
    /// Instance id, 5 bits
    pub iid: u8,
    /// PLDM type
    pub typ: u8,
    /// Command code
    pub cmd: u8,
    /// Payload, not including the 3 header bytes
    pub data: Vec<u8>,
}

/// A PLDM response message, header fields plus payload
#[derive(Debug, Clone, PartialEq)]
pub struct PldmResponse {
    /// Instance id echoed from the request
    pub iid: u8,
    /// PLDM type
    pub typ: u8,
    /// Command code
    pub cmd: u8,
    /// Completion code
    pub cc: u8,
    /// Payload, not including header or completion code
    pub data: Vec<u8>,
}

/// A classified inbound PLDM message
#[derive(Debug)]
pub enum PldmMessage {
    /// Rq bit set
    Request(PldmRequest),
    /// Rq bit clear
    Response(PldmResponse),
}

impl PldmRequest {
    /// Create a request with a payload
    pub fn new_data(iid: u8, typ: u8, cmd: u8, data: Vec<u8>) -> Self {
        Self { iid, typ, cmd, data }
    }

    /// Wire bytes: 3 header bytes then the payload
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(3 + self.data.len());
        v.push(0x80 | (self.iid & 0x1f));
        v.push(self.typ & 0x3f);
        v.push(self.cmd);
        v.extend_from_slice(&self.data);
        v
    }

    /// A response to this request with completion code `cc` and no payload
    pub fn response(&self, cc: u8) -> PldmResponse {
        PldmResponse {
            iid: self.iid,
            typ: self.typ,
            cmd: self.cmd,
            cc,
            data: Vec::new(),
        }
    }

    /// A response to this request with a payload
    pub fn response_data(&self, cc: u8, data: Vec<u8>) -> PldmResponse {
        PldmResponse { data, ..self.response(cc) }
    }
}

impl PldmResponse {
    /// Wire bytes: 4 header bytes then the payload
    pub fn to_vec(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(4 + self.data.len());
        v.push(self.iid & 0x1f);
        v.push(self.typ & 0x3f);
        v.push(self.cmd);
        v.push(self.cc);
        v.extend_from_slice(&self.data);
        v
    }
}

/// Classify an inbound message buffer by the Rq bit
pub fn parse_message(buf: &[u8]) -> Result<PldmMessage> {
    if buf.len() < 3 {
        return Err(Error::Protocol(format!(
            "short message, {} bytes",
            buf.len()
        )));
    }

    let rq = (buf[0] & 0x80) != 0;
    let iid = buf[0] & 0x1f;
    let typ = buf[1] & 0x3f;
    let cmd = buf[2];

    if rq {
        Ok(PldmMessage::Request(PldmRequest {
            iid,
            typ,
            cmd,
            data: buf[3..].to_vec(),
        }))
    } else {
        if buf.len() < 4 {
            return Err(Error::Protocol("response without completion code".into()));
        }
        Ok(PldmMessage::Response(PldmResponse {
            iid,
            typ,
            cmd,
            cc: buf[3],
            data: buf[4..].to_vec(),
        }))
    }
}

fn push_ascii_string(v: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.len() > 0xff {
        return Err(Error::Encode("version string too long"));
    }
    v.push(PLDM_STR_TYPE_ASCII);
    v.push(s.len() as u8);
    v.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Parse a version string preceded by its type and length bytes
pub fn parse_ascii_string(buf: &[u8]) -> VResult<&[u8], String> {
    let (r, (typ, len)) = tuple((le_u8, le_u8))(buf)?;
    map_opt(take(len), move |d: &[u8]| match typ {
        // ascii or utf-8
        1 | 2 => std::str::from_utf8(d).ok().map(str::to_string),
        _ => {
            debug!("unimplemented string type {typ}");
            None
        }
    })(r)
}

/// RequestUpdate request (0x10)
#[derive(Debug, PartialEq)]
pub struct RequestUpdateReq {
    pub max_transfer_size: u32,
    pub num_components: u16,
    pub max_outstanding: u8,
    pub package_data_len: u16,
    pub version: String,
}

impl RequestUpdateReq {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        v.extend_from_slice(&self.max_transfer_size.to_le_bytes());
        v.extend_from_slice(&self.num_components.to_le_bytes());
        v.push(self.max_outstanding);
        v.extend_from_slice(&self.package_data_len.to_le_bytes());
        push_ascii_string(&mut v, &self.version)?;
        Ok(v)
    }

    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (max_transfer_size, num_components, max_outstanding,
                package_data_len, version)) =
            tuple((le_u32, le_u16, le_u8, le_u16, parse_ascii_string))(buf)?;
        Ok((
            r,
            Self {
                max_transfer_size,
                num_components,
                max_outstanding,
                package_data_len,
                version,
            },
        ))
    }
}

/// RequestUpdate response payload
#[derive(Debug, PartialEq)]
pub struct RequestUpdateResp {
    pub fd_meta_data_len: u16,
    pub fd_will_send_pkg_data: u8,
}

impl RequestUpdateResp {
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (fd_meta_data_len, fd_will_send_pkg_data)) =
            tuple((le_u16, le_u8))(buf)?;
        Ok((r, Self { fd_meta_data_len, fd_will_send_pkg_data }))
    }
}

/// PassComponentTable request (0x13)
#[derive(Debug, PartialEq)]
pub struct PassComponentTableReq {
    pub transfer_flag: u8,
    pub classification: u16,
    pub identifier: u16,
    pub classification_index: u8,
    pub comparison_stamp: u32,
    pub version: String,
}

impl PassComponentTableReq {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        v.push(self.transfer_flag);
        v.extend_from_slice(&self.classification.to_le_bytes());
        v.extend_from_slice(&self.identifier.to_le_bytes());
        v.push(self.classification_index);
        v.extend_from_slice(&self.comparison_stamp.to_le_bytes());
        push_ascii_string(&mut v, &self.version)?;
        Ok(v)
    }

    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (transfer_flag, classification, identifier,
                classification_index, comparison_stamp, version)) =
            tuple((le_u8, le_u16, le_u16, le_u8, le_u32, parse_ascii_string))(
                buf,
            )?;
        Ok((
            r,
            Self {
                transfer_flag,
                classification,
                identifier,
                classification_index,
                comparison_stamp,
                version,
            },
        ))
    }
}

/// PassComponentTable response payload
#[derive(Debug, PartialEq)]
pub struct PassComponentTableResp {
    pub comp_response: u8,
    pub comp_response_code: u8,
}

impl PassComponentTableResp {
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (comp_response, comp_response_code)) =
            tuple((le_u8, le_u8))(buf)?;
        Ok((r, Self { comp_response, comp_response_code }))
    }
}

/// UpdateComponent request (0x14)
#[derive(Debug, PartialEq)]
pub struct UpdateComponentReq {
    pub classification: u16,
    pub identifier: u16,
    pub classification_index: u8,
    pub comparison_stamp: u32,
    pub size: u32,
    pub update_option_flags: u32,
    pub version: String,
}

impl UpdateComponentReq {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        v.extend_from_slice(&self.classification.to_le_bytes());
        v.extend_from_slice(&self.identifier.to_le_bytes());
        v.push(self.classification_index);
        v.extend_from_slice(&self.comparison_stamp.to_le_bytes());
        v.extend_from_slice(&self.size.to_le_bytes());
        v.extend_from_slice(&self.update_option_flags.to_le_bytes());
        push_ascii_string(&mut v, &self.version)?;
        Ok(v)
    }

    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (classification, identifier, classification_index,
                comparison_stamp, size, update_option_flags, version)) =
            tuple((
                le_u16,
                le_u16,
                le_u8,
                le_u32,
                le_u32,
                le_u32,
                parse_ascii_string,
            ))(buf)?;
        Ok((
            r,
            Self {
                classification,
                identifier,
                classification_index,
                comparison_stamp,
                size,
                update_option_flags,
                version,
            },
        ))
    }
}

/// UpdateComponent response payload
#[derive(Debug, PartialEq)]
pub struct UpdateComponentResp {
    pub comp_compatibility_resp: u8,
    pub comp_compatibility_resp_code: u8,
    pub update_option_flags_enabled: u32,
    pub time_before_req_fw_data: u16,
}

impl UpdateComponentResp {
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (comp_compatibility_resp, comp_compatibility_resp_code,
                update_option_flags_enabled, time_before_req_fw_data)) =
            tuple((le_u8, le_u8, le_u32, le_u16))(buf)?;
        Ok((
            r,
            Self {
                comp_compatibility_resp,
                comp_compatibility_resp_code,
                update_option_flags_enabled,
                time_before_req_fw_data,
            },
        ))
    }
}

/// RequestFirmwareData request (0x15), FD to UA
#[derive(Debug, PartialEq)]
pub struct RequestFirmwareDataReq {
    pub offset: u32,
    pub length: u32,
}

impl RequestFirmwareDataReq {
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(8);
        v.extend_from_slice(&self.offset.to_le_bytes());
        v.extend_from_slice(&self.length.to_le_bytes());
        v
    }

    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (offset, length)) = tuple((le_u32, le_u32))(buf)?;
        Ok((r, Self { offset, length }))
    }
}

/// TransferComplete request (0x16), FD to UA
#[derive(Debug, PartialEq)]
pub struct TransferCompleteReq {
    pub result: TransferResult,
}

impl TransferCompleteReq {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.result.into()]
    }

    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, result) = le_u8(buf)?;
        Ok((r, Self { result: result.into() }))
    }
}

/// VerifyComplete request (0x17), FD to UA
#[derive(Debug, PartialEq)]
pub struct VerifyCompleteReq {
    pub result: VerifyResult,
}

impl VerifyCompleteReq {
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, result) = le_u8(buf)?;
        Ok((r, Self { result: result.into() }))
    }
}

/// ApplyComplete request (0x18), FD to UA
#[derive(Debug, PartialEq)]
pub struct ApplyCompleteReq {
    pub result: ApplyResult,
    pub comp_activation_modification: u16,
}

impl ApplyCompleteReq {
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, (result, comp_activation_modification)) =
            tuple((le_u8, le_u16))(buf)?;
        Ok((
            r,
            Self {
                result: result.into(),
                comp_activation_modification,
            },
        ))
    }
}

/// ActivateFirmware request (0x1a)
#[derive(Debug, PartialEq)]
pub struct ActivateFirmwareReq {
    pub self_contained_activation: u8,
}

impl ActivateFirmwareReq {
    pub fn encode(&self) -> Vec<u8> {
        vec![self.self_contained_activation]
    }

    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, self_contained_activation) = le_u8(buf)?;
        Ok((r, Self { self_contained_activation }))
    }
}

/// ActivateFirmware response payload
#[derive(Debug, PartialEq)]
pub struct ActivateFirmwareResp {
    pub estimated_time: u16,
}

impl ActivateFirmwareResp {
    pub fn parse(buf: &[u8]) -> VResult<&[u8], Self> {
        let (r, estimated_time) = le_u16(buf)?;
        Ok((r, Self { estimated_time }))
    }
}

/// Parse with `all_consuming`, mapping nom failures to a protocol error
pub fn parse_exact<'a, O>(
    buf: &'a [u8],
    f: impl FnMut(&'a [u8]) -> VResult<&'a [u8], O>,
    what: &str,
) -> Result<O> {
    all_consuming(f)(buf)
        .map(|(_, o)| o)
        .map_err(|_| Error::Protocol(format!("can't parse {what}")))
}
