// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: DSP0267 Update Agent core.
 *
 * Copyright (c) 2024 Code Construct
 */
#![forbid(unsafe_code)]

//! PLDM Type 5 firmware update Update Agent (UA)
//!
//! This crate drives one or more MCTP-attached firmware devices (FDs)
//! through the DSP0267 update sequence: RequestUpdate, PassComponentTable,
//! UpdateComponent, the FD-driven data transfer, and ActivateFirmware.
//!
//! The crate is transport-agnostic and clock-agnostic. The embedding daemon
//! owns the MCTP socket and the clock; it feeds received PLDM messages into
//! [`manager::UpdateManager::handle_message`] and calls
//! [`manager::UpdateManager::update`] with a millisecond timestamp to run
//! deferred work and timeouts.

use thiserror::Error;

pub mod bridge;
pub mod event;
pub mod instance_id;
pub mod manager;
pub mod pkg;
pub mod platform;
pub mod proto;
pub mod requester;
pub mod updater;

/// Firmware Update, PLDM Type 5
pub const PLDM_TYPE_FW: u8 = 5;

/// Platform Monitoring and Control, PLDM Type 2
pub const PLDM_TYPE_PLATFORM: u8 = 2;

/// Baseline transfer size, the minimum chunk an FD may request
pub const PLDM_FW_BASELINE_TRANSFER: u32 = 32;

/// PLDM base completion codes
#[allow(missing_docs)]
#[repr(u8)]
#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum CCode {
    SUCCESS = 0,
    ERROR = 1,
    ERROR_INVALID_DATA = 2,
    ERROR_INVALID_LENGTH = 3,
    ERROR_NOT_READY = 4,
    ERROR_UNSUPPORTED_PLDM_CMD = 5,
    ERROR_INVALID_PLDM_TYPE = 32,
}

/// PLDM firmware update completion codes
#[allow(missing_docs)]
#[repr(u8)]
#[allow(non_camel_case_types)]
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum FwCode {
    NOT_IN_UPDATE_MODE = 0x80,
    ALREADY_IN_UPDATE_MODE = 0x81,
    DATA_OUT_OF_RANGE = 0x82,
    INVALID_TRANSFER_LENGTH = 0x83,
    INVALID_STATE_FOR_COMMAND = 0x84,
    INCOMPLETE_UPDATE = 0x85,
    BUSY_IN_BACKGROUND = 0x86,
    CANCEL_PENDING = 0x87,
    COMMAND_NOT_EXPECTED = 0x88,
    RETRY_REQUEST_FW_DATA = 0x89,
    UNABLE_TO_INITIATE_UPDATE = 0x8A,
    ACTIVATION_NOT_REQUIRED = 0x8B,
    SELF_CONTAINED_ACTIVATION_NOT_PERMITTED = 0x8C,
    NO_DEVICE_METADATA = 0x8D,
    RETRY_REQUEST_UPDATE = 0x8E,
    NO_PACKAGE_DATA = 0x8F,
}

/// Crate error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unexpected PLDM message
    #[error("PLDM protocol error: {0}")]
    Protocol(String),
    /// Request payload could not be encoded
    #[error("PLDM encode error: {0}")]
    Encode(&'static str),
    /// All 32 instance ids for the endpoint are in use
    #[error("no free instance ids for eid {0}")]
    InstanceIdsExhausted(u8),
    /// MCTP transport failure
    #[error("MCTP error: {0}")]
    Mctp(#[from] mctp::Error),
    /// IO error from the package source
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Firmware package contents are inconsistent
    #[error("package error: {0}")]
    Package(String),
}

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Outbound MCTP channel for PLDM messages.
///
/// One whole PLDM message per call; MCTP fragmentation and tag handling
/// happen below this interface.
pub trait Transport {
    /// Send a PLDM message to `eid`.
    fn send(&mut self, eid: mctp::Eid, msg: &[u8]) -> Result<()>;
}
