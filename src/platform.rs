// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: platform event message codec.
 *
 * Copyright (c) 2024 Code Construct
 */

//! The PLDM Type 2 subset used for emitting state sensor events.

use deku::{DekuRead, DekuWrite};

/// PlatformEventMessage command code
pub const PLATFORM_EVENT_MESSAGE: u8 = 0x0a;

/// PlatformEventMessage format version we emit
pub const EVENT_FORMAT_VERSION: u8 = 1;

/// eventClass: sensorEvent
pub const SENSOR_EVENT: u8 = 0x00;

/// sensorEventClass: stateSensorState
pub const STATE_SENSOR_STATE: u8 = 0x01;

/// PlatformEventMessage request payload
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PlatformEventMessageReq {
    pub format_version: u8,
    /// Terminus id of the event source
    pub tid: u8,
    pub event_class: u8,
    /// Class-specific event data
    #[deku(read_all)]
    pub event_data: Vec<u8>,
}

/// PlatformEventMessage response payload
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PlatformEventMessageResp {
    pub platform_event_status: u8,
}

/// Event data for a state sensor state change, DSP0248 table 19
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct StateSensorEventData {
    pub sensor_id: u16,
    pub sensor_event_class: u8,
    pub sensor_offset: u8,
    pub event_state: u8,
    pub previous_event_state: u8,
}
