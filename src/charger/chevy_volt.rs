//! Chevy Volt Gen1 on-board charger.
//!
//! The charger reports HV/LV output in `0x212` and its AC input in `0x30A`. It
//! is commanded with the output mode in `0x30E` (every 30 ms) and the HV
//! voltage/current request in `0x304` (every 200 ms).

use std::sync::Arc;

use tracing::debug;

use crate::can::{Bus, CanInterface, Frame, Identifier};
use crate::charger::{CanCharger, Charger, ChargerLimits, ChargerType, SetpointStore, Telemetry};
use crate::events::{EventCode, EventLog};
use crate::registry::{Cadence, Receiver, Transmitter};

pub const NAME: &str = "Chevy Volt Gen1 Charger";

pub const LIMITS: ChargerLimits = ChargerLimits {
    min_hv: 200.0,
    max_hv: 420.0,
    max_current: 11.5,
    max_power: 3300.0,
};

const ID_STATUS: u32 = 0x212;
const ID_AC_INPUT: u32 = 0x30a;
const ID_MODE: u32 = 0x30e;
const ID_REQUEST: u32 = 0x304;

const MODE_INTERVAL_MS: u64 = 30;
const REQUEST_INTERVAL_MS: u64 = 200;

/// Output mode byte of `0x30E`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Mode {
    Disabled = 0,
    Lv = 1,
    Hv = 2,
    HvLv = 3,
}

impl Mode {
    fn from_enables(hv: bool, lv: bool) -> Mode {
        match (hv, lv) {
            (false, false) => Mode::Disabled,
            (false, true) => Mode::Lv,
            (true, false) => Mode::Hv,
            (true, true) => Mode::HvLv,
        }
    }
}

pub struct ChevyVoltCharger {
    interface: CanInterface,
    setpoints: SetpointStore,
    events: Arc<EventLog>,
    telemetry: Telemetry,
    mode_cadence: Cadence,
    request_cadence: Cadence,
}

impl ChevyVoltCharger {
    pub fn new(interface: CanInterface, setpoints: SetpointStore, events: Arc<EventLog>) -> Self {
        Self {
            interface,
            setpoints,
            events,
            telemetry: Telemetry::default(),
            mode_cadence: Cadence::new(MODE_INTERVAL_MS),
            request_cadence: Cadence::new(REQUEST_INTERVAL_MS),
        }
    }

    fn decode_status(&mut self, d: &[u8]) -> bool {
        if d.len() < 5 {
            return false;
        }
        let hv_current = (u16::from(d[0]) << 5) | (u16::from(d[1]) >> 3);
        let hv_voltage = (u16::from(d[1] & 0x07) << 7) | (u16::from(d[2]) >> 1);
        let lv_current = (u16::from(d[2] & 0x01) << 7) | (u16::from(d[3]) >> 1);
        let lv_voltage = (u16::from(d[3] & 0x01) << 7) | (u16::from(d[4]) >> 1);

        self.telemetry.hv_current = f32::from(hv_current) * 0.05;
        self.telemetry.hv_voltage = f32::from(hv_voltage) * 0.5;
        self.telemetry.lv_current = f32::from(lv_current) * 0.2;
        self.telemetry.lv_voltage = f32::from(lv_voltage) * 0.1;
        true
    }

    fn decode_ac_input(&mut self, d: &[u8]) -> bool {
        if d.len() < 3 {
            return false;
        }
        let ac_current = ((u16::from(d[0]) << 8) | u16::from(d[1])) >> 4;
        let ac_voltage = (u16::from(d[1] & 0x0f) << 4) | (u16::from(d[2]) >> 4);

        self.telemetry.ac_current = f32::from(ac_current) * 0.2;
        self.telemetry.ac_voltage = f32::from(ac_voltage) * 2.0;
        true
    }

    fn send(&self, bus: &Bus, id: u32, data: &[u8]) {
        let frame = match Frame::new(Identifier::Standard(id), data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("{:#x} not built: {}", id, e);
                return;
            }
        };
        // Failures are recorded by the bus.
        let _ = bus.write_frame(&frame, self.interface);
    }
}

impl Charger for ChevyVoltCharger {
    fn charger_type(&self) -> ChargerType {
        ChargerType::ChevyVolt
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn output_power_dc(&self) -> f32 {
        self.telemetry.hv_voltage * self.telemetry.hv_current
    }

    fn efficiency_supported(&self) -> bool {
        true
    }

    fn efficiency(&self) -> Option<f32> {
        let ac_power = self.telemetry.ac_voltage * self.telemetry.ac_current;
        if ac_power > 0.0 {
            Some(self.output_power_dc() / ac_power * 100.0)
        } else {
            Some(0.0)
        }
    }
}

impl CanCharger for ChevyVoltCharger {
    fn interface(&self) -> CanInterface {
        self.interface
    }

    fn decode(&mut self, frame: &Frame) {
        if frame.is_extended() {
            return;
        }
        let id = frame.raw_id();
        let decoded = match id {
            ID_STATUS => self.decode_status(frame.data()),
            ID_AC_INPUT => self.decode_ac_input(frame.data()),
            // 0x266, 0x268 and 0x308 are broadcast too but carry nothing we use
            _ => true,
        };
        if !decoded {
            self.events.report(EventCode::CanDecodeFailure, id);
        }
    }

    fn encode_and_send(&mut self, now_ms: u64, bus: &Bus) {
        let setpoints = self.setpoints.snapshot();

        if self.mode_cadence.due(now_ms) {
            let mode = Mode::from_enables(setpoints.hv_enabled, setpoints.aux12v_enabled);
            self.send(bus, ID_MODE, &[mode as u8]);
        }

        if self.request_cadence.due(now_ms) {
            let voltage = (setpoints.target_voltage * 2.0) as u16;
            let current = (setpoints.target_current * 20.0) as u8;
            self.send(
                bus,
                ID_REQUEST,
                &[0x40, (voltage >> 8) as u8, (voltage & 0xff) as u8, current],
            );
        }
    }
}

impl Transmitter for ChevyVoltCharger {
    fn transmit(&mut self, now_ms: u64, bus: &Bus) {
        self.encode_and_send(now_ms, bus);
    }
}

impl Receiver for ChevyVoltCharger {
    fn receive(&mut self, frame: &Frame, _interface: CanInterface) {
        self.decode(frame);
    }
}
