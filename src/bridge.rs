// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * PLDM firmware update agent: property change to sensor event bridge.
 *
 * Copyright (c) 2024 Code Construct
 */

//! Turns object bus property changes into PLDM state sensor events.
//!
//! Each configured sensor watches one property on an external object bus.
//! When a change matches one of the sensor's value mappings, the bridge
//! emits a PlatformEventMessage carrying the new and previous event state
//! towards the management controller, through the shared request scheduler.

use deku::{DekuContainerRead, DekuContainerWrite};
use log::{debug, error, trace};
use std::collections::HashMap;

use mctp::Eid;

use crate::instance_id::InstanceIdDb;
use crate::platform::{
    PlatformEventMessageReq, PlatformEventMessageResp, StateSensorEventData,
    EVENT_FORMAT_VERSION, PLATFORM_EVENT_MESSAGE, SENSOR_EVENT,
    STATE_SENSOR_STATE,
};
use crate::proto::PldmResponse;
use crate::requester::{Handler, Origin};
use crate::{Transport, PLDM_TYPE_PLATFORM};

/// An observed property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// String property. As a mapping entry, `"||"` separates accepted
    /// synonyms.
    Str(String),
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
}

impl PropertyValue {
    /// Does an observed value select this mapping entry?
    fn matches(&self, observed: &PropertyValue) -> bool {
        match (self, observed) {
            (Self::Str(expect), Self::Str(got)) => {
                expect.split("||").map(str::trim).any(|v| v == got)
            }
            (Self::Bool(expect), Self::Bool(got)) => expect == got,
            (Self::Unsigned(expect), Self::Unsigned(got)) => expect == got,
            (Self::Signed(expect), Self::Signed(got)) => expect == got,
            _ => false,
        }
    }
}

/// Value mapping for one sensor: property value to event state
#[derive(Debug, Clone)]
pub struct SensorMapping {
    /// Event state reported when the value matches
    pub event_state: u8,
    /// Property value (or `"||"` synonyms) selecting this state
    pub value: PropertyValue,
}

/// One watched state sensor
#[derive(Debug, Clone)]
pub struct StateSensorConfig {
    /// Sensor id from the matching state sensor PDR
    pub sensor_id: u16,
    /// Sensor offset within a composite sensor
    pub offset: u8,
    /// Object path the property lives on
    pub object_path: String,
    /// Interface holding the property
    pub interface: String,
    /// Property name
    pub property: String,
    /// Value mappings, first match wins
    pub mappings: Vec<SensorMapping>,
}

/// Emits state sensor events for configured property changes
pub struct SensorEventBridge {
    mc_eid: Eid,
    tid: u8,
    sensors: Vec<StateSensorConfig>,
    // last reported state per (sensor, offset)
    cache: HashMap<(u16, u8), u8>,
}

impl SensorEventBridge {
    /// A bridge reporting to the management controller at `mc_eid` as
    /// terminus `tid`
    pub fn new(mc_eid: Eid, tid: u8, sensors: Vec<StateSensorConfig>) -> Self {
        Self {
            mc_eid,
            tid,
            sensors,
            cache: HashMap::new(),
        }
    }

    /// Process a property change notification.
    ///
    /// Returns the number of events emitted.
    pub fn property_changed<T: Transport>(
        &mut self,
        handler: &mut Handler<T>,
        iids: &mut InstanceIdDb,
        object_path: &str,
        interface: &str,
        property: &str,
        value: &PropertyValue,
    ) -> usize {
        let mut emitted = 0;
        for n in 0..self.sensors.len() {
            let sensor = &self.sensors[n];
            if sensor.object_path != object_path
                || sensor.interface != interface
                || sensor.property != property
            {
                continue;
            }
            let Some(state) = sensor
                .mappings
                .iter()
                .find(|m| m.value.matches(value))
                .map(|m| m.event_state)
            else {
                trace!(
                    "no state mapping for {object_path} {property} {value:?}"
                );
                continue;
            };

            let key = (sensor.sensor_id, sensor.offset);
            // first report for a sensor has previous == new
            let previous = *self.cache.get(&key).unwrap_or(&state);
            let (sensor_id, offset) = key;
            if self.send_sensor_event(
                handler, iids, sensor_id, offset, state, previous,
            ) {
                self.cache.insert(key, state);
                emitted += 1;
            }
        }
        emitted
    }

    fn send_sensor_event<T: Transport>(
        &self,
        handler: &mut Handler<T>,
        iids: &mut InstanceIdDb,
        sensor_id: u16,
        offset: u8,
        state: u8,
        previous: u8,
    ) -> bool {
        let data = StateSensorEventData {
            sensor_id,
            sensor_event_class: STATE_SENSOR_STATE,
            sensor_offset: offset,
            event_state: state,
            previous_event_state: previous,
        };
        debug!(
            "sensor {sensor_id}.{offset} state {previous} -> {state}"
        );

        let iid = match iids.next(self.mc_eid) {
            Ok(iid) => iid,
            Err(e) => {
                error!("sensor event dropped: {e}");
                return false;
            }
        };

        let event_data = match data.to_bytes() {
            Ok(d) => d,
            Err(e) => {
                iids.free(self.mc_eid, iid);
                error!("encoding sensor event data failed: {e}");
                return false;
            }
        };
        let req = PlatformEventMessageReq {
            format_version: EVENT_FORMAT_VERSION,
            tid: self.tid,
            event_class: SENSOR_EVENT,
            event_data,
        };
        let payload = match req.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                iids.free(self.mc_eid, iid);
                error!("encoding platform event message failed: {e}");
                return false;
            }
        };

        if let Err(e) = handler.register(
            self.mc_eid,
            iid,
            PLDM_TYPE_PLATFORM,
            PLATFORM_EVENT_MESSAGE,
            payload,
            Origin::PlatformEvent,
        ) {
            iids.free(self.mc_eid, iid);
            error!("sending platform event message failed: {e}");
            return false;
        }
        true
    }

    /// Handle the response (or timeout) of an emitted event message.
    ///
    /// Event delivery is fire and forget; failures are only logged.
    pub fn on_event_response(eid: Eid, resp: Option<&PldmResponse>) {
        let Some(resp) = resp else {
            error!("no response from {eid} for platform event message");
            return;
        };
        if resp.cc != 0 {
            error!(
                "platform event message to {eid} failed, completion code \
                 0x{:02x}",
                resp.cc
            );
            return;
        }
        match PlatformEventMessageResp::from_bytes((resp.data.as_slice(), 0)) {
            Ok((_, r)) => trace!(
                "platform event accepted by {eid}, status {}",
                r.platform_event_status
            ),
            Err(e) => {
                error!("bad platform event message response from {eid}: {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{parse_message, PldmMessage};
    use crate::Result;
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

    const MC: Eid = Eid(8);

    fn power_sensor() -> StateSensorConfig {
        StateSensorConfig {
            sensor_id: 0x21,
            offset: 0,
            object_path: "/xyz/host0".to_string(),
            interface: "xyz.State.Host".to_string(),
            property: "CurrentHostState".to_string(),
            mappings: vec![
                SensorMapping {
                    event_state: 1,
                    value: PropertyValue::Str("Off || Quiesced".to_string()),
                },
                SensorMapping {
                    event_state: 2,
                    value: PropertyValue::Str("Running".to_string()),
                },
            ],
        }
    }

    fn event_data(wire: &[u8]) -> StateSensorEventData {
        let PldmMessage::Request(req) = parse_message(wire).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.typ, PLDM_TYPE_PLATFORM);
        assert_eq!(req.cmd, PLATFORM_EVENT_MESSAGE);
        let (_, msg) =
            PlatformEventMessageReq::from_bytes((req.data.as_slice(), 0))
                .unwrap();
        assert_eq!(msg.event_class, SENSOR_EVENT);
        let (_, data) =
            StateSensorEventData::from_bytes((msg.event_data.as_slice(), 0))
                .unwrap();
        data
    }

    #[test]
    fn synonym_matching() {
        let m = SensorMapping {
            event_state: 1,
            value: PropertyValue::Str("Off || Quiesced".to_string()),
        };
        assert!(m.value.matches(&PropertyValue::Str("Off".into())));
        assert!(m.value.matches(&PropertyValue::Str("Quiesced".into())));
        assert!(!m.value.matches(&PropertyValue::Str("Running".into())));
        assert!(!m.value.matches(&PropertyValue::Bool(true)));
    }

    #[test]
    fn event_emission_and_cache() {
        let t = RecordingTransport::default();
        let sent = t.sent.clone();
        let mut handler = Handler::new(t, 1000);
        let mut iids = InstanceIdDb::new();
        let mut bridge = SensorEventBridge::new(MC, 1, vec![power_sensor()]);

        // first hit seeds the previous state with the new state
        let n = bridge.property_changed(
            &mut handler,
            &mut iids,
            "/xyz/host0",
            "xyz.State.Host",
            "CurrentHostState",
            &PropertyValue::Str("Running".into()),
        );
        assert_eq!(n, 1);
        let data = event_data(&sent.borrow()[0].1);
        assert_eq!(data.sensor_id, 0x21);
        assert_eq!(data.event_state, 2);
        assert_eq!(data.previous_event_state, 2);

        // complete the dialog so the next event may transmit
        let PldmMessage::Request(req) =
            parse_message(&sent.borrow()[0].1).unwrap()
        else {
            panic!();
        };
        let resp = req.response_data(0, vec![0]);
        let p = handler.take_response(MC, &resp).unwrap();
        iids.free(MC, p.iid);

        // second hit reports the cached state as previous
        let n = bridge.property_changed(
            &mut handler,
            &mut iids,
            "/xyz/host0",
            "xyz.State.Host",
            "CurrentHostState",
            &PropertyValue::Str("Quiesced".into()),
        );
        assert_eq!(n, 1);
        let data = event_data(&sent.borrow()[1].1);
        assert_eq!(data.event_state, 1);
        assert_eq!(data.previous_event_state, 2);
    }

    #[test]
    fn unmatched_property_ignored() {
        let t = RecordingTransport::default();
        let sent = t.sent.clone();
        let mut handler = Handler::new(t, 1000);
        let mut iids = InstanceIdDb::new();
        let mut bridge = SensorEventBridge::new(MC, 1, vec![power_sensor()]);

        // wrong property name
        let n = bridge.property_changed(
            &mut handler,
            &mut iids,
            "/xyz/host0",
            "xyz.State.Host",
            "RequestedHostTransition",
            &PropertyValue::Str("Running".into()),
        );
        assert_eq!(n, 0);

        // unmapped value
        let n = bridge.property_changed(
            &mut handler,
            &mut iids,
            "/xyz/host0",
            "xyz.State.Host",
            "CurrentHostState",
            &PropertyValue::Str("DiagnosticMode".into()),
        );
        assert_eq!(n, 0);
        assert!(sent.borrow().is_empty());
        assert_eq!(iids.in_use(MC), 0);
    }
}
