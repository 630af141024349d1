//! Nissan Leaf PDM (power delivery module) charger.
//!
//! The PDM wakes up with `0x679` and reports its output power and charge state
//! in `0x390`. It only reports power, so the HV voltage shown is the commanded
//! voltage and the current is derived from the two. Commands go out as `0x1F2`
//! and `0x1DB` every 10 ms, plus a `0x50B` keepalive every 100 ms.

use std::sync::Arc;

use tracing::{debug, info};

use crate::can::{Bus, CanInterface, Frame, Identifier};
use crate::charger::{CanCharger, Charger, ChargerLimits, ChargerType, SetpointStore, Telemetry};
use crate::events::{EventCode, EventLog};
use crate::registry::{Cadence, Receiver, Transmitter};

pub const NAME: &str = "Nissan Leaf 3.3/6.6kW PDM";

pub const LIMITS: ChargerLimits = ChargerLimits {
    min_hv: 240.0,
    max_hv: 410.0,
    max_current: 16.0,
    max_power: 6600.0,
};

const ID_WAKE: u32 = 0x679;
const ID_STATUS: u32 = 0x390;
const ID_POWER_REQUEST: u32 = 0x1f2;
const ID_BATTERY: u32 = 0x1db;
const ID_KEEPALIVE: u32 = 0x50b;

const COMMAND_INTERVAL_MS: u64 = 10;
const KEEPALIVE_INTERVAL_MS: u64 = 100;

const KEEPALIVE: [u8; 7] = [0x00, 0x00, 0x06, 0xc0, 0x00, 0x00, 0x00];

/// CRC-8 with polynomial 0x85 used on the battery status frame.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x85 } else { crc << 1 };
        }
    }
    crc
}

/// Nibble checksum of the power request frame.
fn nibble_checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|b| u32::from(b >> 4) + u32::from(b & 0x0f)).sum();
    ((sum + 2) & 0x0f) as u8
}

pub struct NissanLeafCharger {
    interface: CanInterface,
    setpoints: SetpointStore,
    events: Arc<EventLog>,
    telemetry: Telemetry,
    awake: bool,
    output_power: f32,
    charge_status: u8,
    counter: u8,
    command_cadence: Cadence,
    keepalive_cadence: Cadence,
}

impl NissanLeafCharger {
    pub fn new(interface: CanInterface, setpoints: SetpointStore, events: Arc<EventLog>) -> Self {
        Self {
            interface,
            setpoints,
            events,
            telemetry: Telemetry::default(),
            awake: false,
            output_power: 0.0,
            charge_status: 0,
            counter: 0,
            command_cadence: Cadence::new(COMMAND_INTERVAL_MS),
            keepalive_cadence: Cadence::new(KEEPALIVE_INTERVAL_MS),
        }
    }

    /// Whether the PDM has announced itself since startup.
    pub fn is_awake(&self) -> bool {
        self.awake
    }

    /// Raw charge status field of the last `0x390`.
    pub fn charge_status(&self) -> u8 {
        self.charge_status
    }

    fn decode_status(&mut self, d: &[u8]) -> bool {
        if d.len() < 6 {
            return false;
        }
        let power = (u16::from(d[0] & 0x01) << 8) | u16::from(d[1]);
        self.output_power = f32::from(power) * 100.0;
        self.charge_status = (d[5] & 0x7e) >> 1;
        self.telemetry.ac_voltage = if d[3] & 0x20 != 0 { 230.0 } else { 120.0 };
        self.telemetry.ac_current = self.output_power / self.telemetry.ac_voltage;

        let voltage = self.setpoints.snapshot().target_voltage;
        self.telemetry.hv_voltage = voltage;
        self.telemetry.hv_current = if voltage > 0.0 { self.output_power / voltage } else { 0.0 };
        true
    }

    fn send(&self, bus: &Bus, id: u32, data: &[u8]) {
        match Frame::new(Identifier::Standard(id), data) {
            Ok(frame) => {
                let _ = bus.write_frame(&frame, self.interface);
            }
            Err(e) => debug!("{:#x} not built: {}", id, e),
        }
    }

    fn power_request(&self, limit_w: f32, hv: bool, aux: bool) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[0] = (limit_w / 100.0).clamp(0.0, 255.0) as u8;
        data[1] = 0x64;
        data[2] = u8::from(hv) | (u8::from(aux) << 1);
        data[6] = self.counter;
        data[7] = nibble_checksum(&data[..7]);
        data
    }

    fn battery_status(&self, voltage: f32, current: f32, end_current: f32) -> [u8; 8] {
        let voltage = (voltage * 2.0) as u16;
        let current = (current * 2.0) as u16;
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&current.to_be_bytes());
        data[2..4].copy_from_slice(&voltage.to_be_bytes());
        data[4] = (end_current * 10.0).clamp(0.0, 255.0) as u8;
        data[6] = self.counter;
        data[7] = crc8(&data[..7]);
        data
    }
}

impl Charger for NissanLeafCharger {
    fn charger_type(&self) -> ChargerType {
        ChargerType::NissanLeaf
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn output_power_dc(&self) -> f32 {
        self.output_power
    }
}

impl CanCharger for NissanLeafCharger {
    fn interface(&self) -> CanInterface {
        self.interface
    }

    fn decode(&mut self, frame: &Frame) {
        if frame.is_extended() {
            return;
        }
        let decoded = match frame.raw_id() {
            ID_WAKE => {
                if !self.awake {
                    info!("{} awake", NAME);
                }
                self.awake = true;
                true
            }
            ID_STATUS => self.decode_status(frame.data()),
            _ => true,
        };
        if !decoded {
            self.events.report(EventCode::CanDecodeFailure, frame.raw_id());
        }
    }

    fn encode_and_send(&mut self, now_ms: u64, bus: &Bus) {
        let setpoints = self.setpoints.snapshot();

        if self.command_cadence.due(now_ms) {
            let limit = (setpoints.target_voltage * setpoints.target_current).min(LIMITS.max_power);
            let request = self.power_request(limit, setpoints.hv_enabled, setpoints.aux12v_enabled);
            self.send(bus, ID_POWER_REQUEST, &request);

            let status = self.battery_status(
                setpoints.target_voltage,
                setpoints.target_current,
                setpoints.end_current,
            );
            self.send(bus, ID_BATTERY, &status);

            self.counter = (self.counter + 1) % 4;
        }

        if self.keepalive_cadence.due(now_ms) {
            self.send(bus, ID_KEEPALIVE, &KEEPALIVE);
        }
    }
}

impl Transmitter for NissanLeafCharger {
    fn transmit(&mut self, now_ms: u64, bus: &Bus) {
        self.encode_and_send(now_ms, bus);
    }
}

impl Receiver for NissanLeafCharger {
    fn receive(&mut self, frame: &Frame, _interface: CanInterface) {
        self.decode(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::{BusBuilder, InterfaceConfig, VirtualCan, VirtualCanHandle};

    fn setup() -> (NissanLeafCharger, SetpointStore, Arc<EventLog>) {
        let events = Arc::new(EventLog::new());
        let setpoints = SetpointStore::new(LIMITS, events.clone());
        let charger = NissanLeafCharger::new(CanInterface::AddonCan, setpoints.clone(), events.clone());
        (charger, setpoints, events)
    }

    fn bus() -> (Bus, VirtualCanHandle) {
        let (driver, handle) = VirtualCan::new(CanInterface::AddonCan);
        let bus = BusBuilder::new(Arc::new(EventLog::new()))
            .attach(InterfaceConfig::addon(CanInterface::AddonCan, 16), driver)
            .unwrap()
            .build();
        (bus, handle)
    }

    fn frame(id: u32, data: &[u8]) -> Frame {
        Frame::new(Identifier::Standard(id), data).unwrap()
    }

    #[test]
    fn crc_residue_is_zero() {
        let data = [0x00, 0x14, 0x03, 0x20, 0x05, 0x00, 0x02];
        let crc = crc8(&data);
        let mut with_crc = data.to_vec();
        with_crc.push(crc);
        assert_eq!(crc8(&with_crc), 0);
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn wake_and_status() {
        let (mut charger, setpoints, events) = setup();
        setpoints.set_targets(400.0, 8.0).unwrap();

        assert!(!charger.is_awake());
        charger.decode(&frame(ID_WAKE, &[]));
        assert!(charger.is_awake());

        // 0x020 = 32 -> 3200 W, 230 V input, status 5
        charger.decode(&frame(ID_STATUS, &[0x00, 0x20, 0x00, 0x20, 0x00, 5 << 1, 0x00, 0x00]));
        assert_eq!(charger.output_power_dc(), 3200.0);
        assert_eq!(charger.charge_status(), 5);
        assert_eq!(charger.ac_input_voltage(), 230.0);
        assert_eq!(charger.hvdc_output_voltage(), 400.0);
        assert!((charger.hvdc_output_current() - 8.0).abs() < 1e-3);
        assert!(!charger.efficiency_supported());
        assert_eq!(charger.efficiency(), None);

        // high bit of the power field, 120 V input
        charger.decode(&frame(ID_STATUS, &[0x01, 0x2c, 0x00, 0x00, 0x00, 0x00]));
        assert_eq!(charger.output_power_dc(), 30000.0);
        assert_eq!(charger.ac_input_voltage(), 120.0);
        assert_eq!(events.occurrences(EventCode::CanDecodeFailure), 0);
    }

    #[test]
    fn short_status_is_reported() {
        let (mut charger, _, events) = setup();
        charger.decode(&frame(ID_STATUS, &[0x01, 0x2c]));
        assert_eq!(charger.output_power_dc(), 0.0);
        assert_eq!(events.get(EventCode::CanDecodeFailure).unwrap().data, ID_STATUS);
    }

    #[test]
    fn command_frames() {
        let (mut charger, setpoints, _) = setup();
        let (bus, handle) = bus();
        setpoints.set_targets(400.0, 8.0).unwrap();
        setpoints.set_end_current(0.5).unwrap();
        setpoints.set_hv_enabled(true);

        charger.encode_and_send(0, &bus);
        let sent = handle.take_transmitted();
        let ids: Vec<u32> = sent.iter().map(|f| f.raw_id()).collect();
        assert_eq!(ids, vec![ID_POWER_REQUEST, ID_BATTERY, ID_KEEPALIVE]);

        let request = sent[0].data();
        assert_eq!(request[0], 32);
        assert_eq!(request[1], 0x64);
        assert_eq!(request[2], 0x01);
        assert_eq!(request[6], 0);
        assert_eq!(request[7], nibble_checksum(&request[..7]));

        let status = sent[1].data();
        assert_eq!(&status[0..2], &16u16.to_be_bytes());
        assert_eq!(&status[2..4], &800u16.to_be_bytes());
        assert_eq!(status[4], 5);
        assert_eq!(crc8(status), 0);

        assert_eq!(sent[2].data(), &KEEPALIVE);
    }

    #[test]
    fn counter_wraps_every_four_commands() {
        let (mut charger, _, _) = setup();
        let (bus, handle) = bus();

        for now in 0..100 {
            charger.transmit(now, &bus);
        }
        let counters: Vec<u8> = handle
            .take_transmitted()
            .iter()
            .filter(|f| f.raw_id() == ID_POWER_REQUEST)
            .map(|f| f.data()[6])
            .collect();
        assert_eq!(counters, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn command_rates() {
        let (mut charger, _, _) = setup();
        let (bus, handle) = bus();
        for now in 0..1000 {
            charger.transmit(now, &bus);
        }
        let sent = handle.take_transmitted();
        let count = |id| sent.iter().filter(|f| f.raw_id() == id).count();
        assert_eq!(count(ID_POWER_REQUEST), 100);
        assert_eq!(count(ID_BATTERY), 100);
        assert_eq!(count(ID_KEEPALIVE), 10);
    }
}
