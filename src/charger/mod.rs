//! Charger abstraction and the supported charger protocols.
//!
//! A [`Charger`] exposes the telemetry of whatever charger is connected. The
//! accessors default to the decoded [`Telemetry`] snapshot, so a protocol only
//! has to keep that snapshot up to date. A charger that talks CAN additionally
//! implements [`CanCharger`], and is registered both as a
//! [`Transmitter`](crate::registry::Transmitter) and as a
//! [`Receiver`](crate::registry::Receiver) on its interface by [`setup_charger`].
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use charger_emulator::can::CanInterface;
//! use charger_emulator::charger::{setup_charger, ChargerType, SetpointStore};
//! use charger_emulator::events::EventLog;
//! use charger_emulator::registry::RegistryBuilder;
//!
//! let events = Arc::new(EventLog::new());
//! let setpoints = SetpointStore::new(ChargerType::ChevyVolt.limits(), events.clone());
//! let mut registry = RegistryBuilder::new();
//!
//! let charger = setup_charger(ChargerType::ChevyVolt, CanInterface::NativeCan, &setpoints, &events, &mut registry)
//!     .unwrap();
//! assert_eq!(charger.lock().unwrap().name(), "Chevy Volt Gen1 Charger");
//! ```

pub mod chevy_volt;
pub mod error;
pub mod nissan_leaf;
pub mod setpoints;

use std::sync::{Arc, Mutex};

use strum::IntoEnumIterator;
use strum_macros::{EnumIter, FromRepr};
use tracing::info;

use crate::can::{Bus, CanInterface, Frame};
use crate::events::EventLog;
use crate::registry::{Receiver, RegistryBuilder, Transmitter};

pub use chevy_volt::ChevyVoltCharger;
pub use error::SetpointError;
pub use nissan_leaf::NissanLeafCharger;
pub use setpoints::{SetpointStore, Setpoints};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, EnumIter, FromRepr)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ChargerType {
    None = 0,
    NissanLeaf = 1,
    ChevyVolt = 2,
}

impl ChargerType {
    /// Human readable protocol name.
    pub fn name(&self) -> &'static str {
        match self {
            ChargerType::None => "None",
            ChargerType::NissanLeaf => nissan_leaf::NAME,
            ChargerType::ChevyVolt => chevy_volt::NAME,
        }
    }

    /// Hardware limits of the protocol's charger.
    pub fn limits(&self) -> ChargerLimits {
        match self {
            ChargerType::None => ChargerLimits::default(),
            ChargerType::NissanLeaf => nissan_leaf::LIMITS,
            ChargerType::ChevyVolt => chevy_volt::LIMITS,
        }
    }
}

/// Charger types that can be selected, excluding `None`.
pub fn supported_charger_types() -> Vec<ChargerType> {
    ChargerType::iter().filter(|t| *t != ChargerType::None).collect()
}

/// Setpoint limits imposed by a charger.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChargerLimits {
    pub min_hv: f32,
    pub max_hv: f32,
    pub max_current: f32,
    pub max_power: f32,
}

impl ChargerLimits {
    /// Tighten the current limit with a user configured maximum.
    pub fn with_user_max_current(mut self, max_current: Option<f32>) -> Self {
        if let Some(max_current) = max_current {
            self.max_current = self.max_current.min(max_current.max(0.0));
        }
        self
    }
}

/// Decoded charger telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Telemetry {
    pub hv_voltage: f32,
    pub hv_current: f32,
    pub lv_voltage: f32,
    pub lv_current: f32,
    pub ac_voltage: f32,
    pub ac_current: f32,
}

/// Generic charger telemetry and identity.
pub trait Charger: Send {
    fn charger_type(&self) -> ChargerType;

    fn name(&self) -> &'static str;

    /// Latest decoded telemetry.
    fn telemetry(&self) -> &Telemetry;

    /// DC output power in W.
    fn output_power_dc(&self) -> f32;

    fn hvdc_output_voltage(&self) -> f32 {
        self.telemetry().hv_voltage
    }
    fn hvdc_output_current(&self) -> f32 {
        self.telemetry().hv_current
    }

    fn lvdc_output_voltage(&self) -> f32 {
        self.telemetry().lv_voltage
    }
    fn lvdc_output_current(&self) -> f32 {
        self.telemetry().lv_current
    }

    fn ac_input_voltage(&self) -> f32 {
        self.telemetry().ac_voltage
    }
    fn ac_input_current(&self) -> f32 {
        self.telemetry().ac_current
    }

    fn efficiency_supported(&self) -> bool {
        false
    }
    /// Conversion efficiency in percent, `None` when the charger does not report enough to derive it.
    fn efficiency(&self) -> Option<f32> {
        None
    }
}

/// A charger driven over CAN.
pub trait CanCharger: Charger + Transmitter + Receiver {
    /// Interface the charger is wired to.
    fn interface(&self) -> CanInterface;

    /// Map one inbound frame onto the telemetry. Unknown ids are ignored.
    fn decode(&mut self, frame: &Frame);

    /// Send every outbound message whose interval has elapsed at `now_ms`.
    fn encode_and_send(&mut self, now_ms: u64, bus: &Bus);
}

/// Shared handle to the active charger, for readers outside the control loop.
pub type ChargerHandle = Arc<Mutex<dyn Charger>>;

fn install<C: CanCharger + 'static>(charger: C, registry: &mut RegistryBuilder) -> ChargerHandle {
    let interface = charger.interface();
    info!("charger {} on {}", charger.name(), interface);

    let charger = Arc::new(Mutex::new(charger));
    registry.register_transmitter(charger.clone());
    registry.register_receiver(charger.clone(), interface);
    charger
}

/// Construct the configured charger and register it with the control loop.
/// Returns `None` when no charger is configured.
pub fn setup_charger(
    charger_type: ChargerType,
    interface: CanInterface,
    setpoints: &SetpointStore,
    events: &Arc<EventLog>,
    registry: &mut RegistryBuilder,
) -> Option<ChargerHandle> {
    match charger_type {
        ChargerType::None => None,
        ChargerType::NissanLeaf => Some(install(
            NissanLeafCharger::new(interface, setpoints.clone(), events.clone()),
            registry,
        )),
        ChargerType::ChevyVolt => Some(install(
            ChevyVoltCharger::new(interface, setpoints.clone(), events.clone()),
            registry,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_types_exclude_none() {
        assert_eq!(
            supported_charger_types(),
            vec![ChargerType::NissanLeaf, ChargerType::ChevyVolt]
        );
    }

    #[test]
    fn no_charger_registers_nothing() {
        let events = Arc::new(EventLog::new());
        let setpoints = SetpointStore::new(ChargerLimits::default(), events.clone());
        let mut builder = RegistryBuilder::new();
        let charger = setup_charger(ChargerType::None, CanInterface::NativeCan, &setpoints, &events, &mut builder);
        assert!(charger.is_none());

        let registry = builder.build();
        assert_eq!(registry.transmitter_count(), 0);
        assert_eq!(registry.receiver_count(CanInterface::NativeCan), 0);
    }

    #[test]
    fn charger_registers_once_on_its_interface() {
        let events = Arc::new(EventLog::new());
        let setpoints = SetpointStore::new(ChargerType::NissanLeaf.limits(), events.clone());
        let mut builder = RegistryBuilder::new();
        let charger = setup_charger(
            ChargerType::NissanLeaf,
            CanInterface::AddonCan,
            &setpoints,
            &events,
            &mut builder,
        )
        .unwrap();
        assert_eq!(charger.lock().unwrap().charger_type(), ChargerType::NissanLeaf);

        let registry = builder.build();
        assert_eq!(registry.transmitter_count(), 1);
        assert_eq!(registry.receiver_count(CanInterface::AddonCan), 1);
        assert_eq!(registry.receiver_count(CanInterface::NativeCan), 0);
    }

    #[test]
    fn user_current_limit_only_tightens() {
        let limits = ChargerType::ChevyVolt.limits();
        assert_eq!(limits.with_user_max_current(Some(5.0)).max_current, 5.0);
        assert_eq!(limits.with_user_max_current(Some(50.0)).max_current, limits.max_current);
        assert_eq!(limits.with_user_max_current(None), limits);
    }
}
