//! Commanded charger setpoints.
//!
//! The setpoints are written by whoever drives the emulator (the web front end,
//! a test) and read by the active charger protocol every time it builds a
//! command frame. Every change is validated against the protocol limits first;
//! a rejected change leaves all setpoints as they were.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::charger::error::SetpointError;
use crate::charger::ChargerLimits;
use crate::config::SettingsStore;
use crate::events::{EventCode, EventLog};
use crate::Result;

pub const KEY_TARGET_VOLTAGE: &str = "CHGSETV";
pub const KEY_TARGET_CURRENT: &str = "CHGSETA";
pub const KEY_END_CURRENT: &str = "CHGENDA";
pub const KEY_HV_ENABLED: &str = "CHGHVEN";
pub const KEY_AUX12V_ENABLED: &str = "CHGAUXEN";

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Setpoints {
    /// HV DC target voltage in V
    pub target_voltage: f32,
    /// HV DC target current in A
    pub target_current: f32,
    /// Current at which charging is considered complete, in A
    pub end_current: f32,
    pub hv_enabled: bool,
    pub aux12v_enabled: bool,
}

impl Setpoints {
    /// Echo the setpoints into the settings store so they survive a reboot.
    pub fn persist(&self, store: &mut dyn SettingsStore) -> Result<()> {
        store.put_f32(KEY_TARGET_VOLTAGE, self.target_voltage)?;
        store.put_f32(KEY_TARGET_CURRENT, self.target_current)?;
        store.put_f32(KEY_END_CURRENT, self.end_current)?;
        store.put_bool(KEY_HV_ENABLED, self.hv_enabled)?;
        store.put_bool(KEY_AUX12V_ENABLED, self.aux12v_enabled)?;
        Ok(())
    }
}

/// Shared, validated setpoints. Cloning shares the same underlying values.
#[derive(Debug, Clone)]
pub struct SetpointStore {
    values: Arc<Mutex<Setpoints>>,
    limits: ChargerLimits,
    events: Arc<EventLog>,
}

fn finite(value: f32) -> std::result::Result<f32, SetpointError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SetpointError::NotANumber(value))
    }
}

impl SetpointStore {
    /// `limits` should already include any user limit on the charge current.
    pub fn new(limits: ChargerLimits, events: Arc<EventLog>) -> Self {
        Self {
            values: Arc::new(Mutex::new(Setpoints::default())),
            limits,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Setpoints> {
        // Setpoints are plain values, a panic mid-update cannot leave them torn.
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn limits(&self) -> ChargerLimits {
        self.limits
    }

    /// Copy of the current setpoints.
    pub fn snapshot(&self) -> Setpoints {
        *self.lock()
    }

    fn reject<T>(&self, err: SetpointError, requested: f32) -> std::result::Result<T, SetpointError> {
        warn!("setpoint rejected: {}", err);
        self.events
            .report(EventCode::SetpointRejected, (requested.max(0.0) * 10.0) as u32);
        Err(err)
    }

    fn check_voltage(&self, voltage: f32) -> std::result::Result<(), SetpointError> {
        if voltage < self.limits.min_hv || voltage > self.limits.max_hv {
            return Err(SetpointError::VoltageOutOfRange {
                value: voltage,
                min: self.limits.min_hv,
                max: self.limits.max_hv,
            });
        }
        Ok(())
    }

    fn check_current(&self, current: f32) -> std::result::Result<(), SetpointError> {
        if !(0.0..=self.limits.max_current).contains(&current) {
            return Err(SetpointError::CurrentOutOfRange {
                value: current,
                max: self.limits.max_current,
            });
        }
        Ok(())
    }

    fn check_power(&self, voltage: f32, current: f32) -> std::result::Result<(), SetpointError> {
        if voltage * current > self.limits.max_power {
            return Err(SetpointError::PowerLimitExceeded {
                voltage,
                current,
                max: self.limits.max_power,
            });
        }
        Ok(())
    }

    /// Set the target voltage. Accepted when within the voltage window and the
    /// resulting power with the current target stays within the power limit.
    pub fn set_target_voltage(&self, voltage: f32) -> std::result::Result<f32, SetpointError> {
        let mut values = self.lock();
        let checked = finite(voltage)
            .and_then(|v| self.check_voltage(v))
            .and_then(|_| self.check_power(voltage, values.target_current));
        if let Err(err) = checked {
            drop(values);
            return self.reject(err, voltage);
        }
        values.target_voltage = voltage;
        info!("charger target voltage set to {} V", voltage);
        Ok(voltage)
    }

    /// Set the target current, checked against the current limit and the power limit.
    pub fn set_target_current(&self, current: f32) -> std::result::Result<f32, SetpointError> {
        let mut values = self.lock();
        let checked = finite(current)
            .and_then(|c| self.check_current(c))
            .and_then(|_| self.check_power(values.target_voltage, current));
        if let Err(err) = checked {
            drop(values);
            return self.reject(err, current);
        }
        values.target_current = current;
        info!("charger target current set to {} A", current);
        Ok(current)
    }

    /// Set voltage and current together; either both are accepted or neither.
    pub fn set_targets(&self, voltage: f32, current: f32) -> std::result::Result<(f32, f32), SetpointError> {
        let mut values = self.lock();
        let checked = finite(voltage)
            .and_then(|_| finite(current))
            .and_then(|_| self.check_voltage(voltage))
            .and_then(|_| self.check_current(current))
            .and_then(|_| self.check_power(voltage, current));
        if let Err(err) = checked {
            drop(values);
            return self.reject(err, voltage * current);
        }
        values.target_voltage = voltage;
        values.target_current = current;
        info!("charger targets set to {} V, {} A", voltage, current);
        Ok((voltage, current))
    }

    pub fn set_end_current(&self, current: f32) -> std::result::Result<f32, SetpointError> {
        let mut values = self.lock();
        let checked = finite(current).and_then(|c| {
            if (0.0..=self.limits.max_current).contains(&c) {
                Ok(())
            } else {
                Err(SetpointError::EndCurrentOutOfRange {
                    value: c,
                    max: self.limits.max_current,
                })
            }
        });
        if let Err(err) = checked {
            drop(values);
            return self.reject(err, current);
        }
        values.end_current = current;
        Ok(current)
    }

    pub fn set_hv_enabled(&self, enabled: bool) {
        self.lock().hv_enabled = enabled;
        info!("charger HV {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_aux12v_enabled(&self, enabled: bool) {
        self.lock().aux12v_enabled = enabled;
        info!("charger aux 12V {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Load previously persisted setpoints. Values that no longer validate are skipped.
    pub fn restore(&self, store: &dyn SettingsStore) {
        if let (Some(voltage), Some(current)) = (
            store.get_f32(KEY_TARGET_VOLTAGE),
            store.get_f32(KEY_TARGET_CURRENT),
        ) {
            let _ = self.set_targets(voltage, current);
        }
        if let Some(current) = store.get_f32(KEY_END_CURRENT) {
            let _ = self.set_end_current(current);
        }
        if let Some(enabled) = store.get_bool(KEY_HV_ENABLED) {
            self.set_hv_enabled(enabled);
        }
        if let Some(enabled) = store.get_bool(KEY_AUX12V_ENABLED) {
            self.set_aux12v_enabled(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;

    const LIMITS: ChargerLimits = ChargerLimits {
        min_hv: 200.0,
        max_hv: 420.0,
        max_current: 11.5,
        max_power: 3300.0,
    };

    fn store() -> SetpointStore {
        SetpointStore::new(LIMITS, Arc::new(EventLog::new()))
    }

    #[test]
    fn accepts_targets_within_limits() {
        let setpoints = store();
        assert_eq!(setpoints.set_targets(400.0, 8.0), Ok((400.0, 8.0)));
        assert_eq!(setpoints.set_end_current(1.0), Ok(1.0));

        let snapshot = setpoints.snapshot();
        assert_eq!(snapshot.target_voltage, 400.0);
        assert_eq!(snapshot.target_current, 8.0);
        assert_eq!(snapshot.end_current, 1.0);
    }

    #[test]
    fn power_limit_rejects_pair_and_keeps_previous() {
        let setpoints = store();
        setpoints.set_targets(300.0, 10.0).unwrap();

        // 400 V * 11 A = 4400 W > 3300 W, although both axes are in range.
        let err = setpoints.set_targets(400.0, 11.0).unwrap_err();
        assert!(matches!(err, SetpointError::PowerLimitExceeded { .. }));

        let snapshot = setpoints.snapshot();
        assert_eq!(snapshot.target_voltage, 300.0);
        assert_eq!(snapshot.target_current, 10.0);
    }

    #[test]
    fn single_axis_changes_check_power_against_the_other() {
        let setpoints = store();
        setpoints.set_targets(300.0, 10.0).unwrap();

        assert!(matches!(
            setpoints.set_target_voltage(400.0),
            Err(SetpointError::PowerLimitExceeded { .. })
        ));
        assert_eq!(setpoints.set_target_current(11.0), Ok(11.0));
        assert!(matches!(
            setpoints.set_target_voltage(301.0),
            Err(SetpointError::PowerLimitExceeded { .. })
        ));
        assert_eq!(setpoints.snapshot().target_voltage, 300.0);
    }

    #[test]
    fn per_axis_limits() {
        let setpoints = store();
        assert!(matches!(
            setpoints.set_target_voltage(199.0),
            Err(SetpointError::VoltageOutOfRange { .. })
        ));
        assert!(matches!(
            setpoints.set_target_voltage(421.0),
            Err(SetpointError::VoltageOutOfRange { .. })
        ));
        assert!(matches!(
            setpoints.set_target_current(12.0),
            Err(SetpointError::CurrentOutOfRange { .. })
        ));
        assert!(matches!(
            setpoints.set_target_current(-1.0),
            Err(SetpointError::CurrentOutOfRange { .. })
        ));
        assert!(matches!(
            setpoints.set_end_current(20.0),
            Err(SetpointError::EndCurrentOutOfRange { .. })
        ));
        assert_eq!(
            setpoints.set_target_voltage(f32::NAN).map_err(|e| e.to_string()),
            Err("NaN is not a valid number".to_string())
        );
        assert_eq!(setpoints.snapshot(), Setpoints::default());
    }

    #[test]
    fn rejections_are_reported() {
        let events = Arc::new(EventLog::new());
        let setpoints = SetpointStore::new(LIMITS, events.clone());
        let _ = setpoints.set_target_current(100.0);
        assert_eq!(events.occurrences(EventCode::SetpointRejected), 1);
        assert_eq!(events.get(EventCode::SetpointRejected).unwrap().data, 1000);
    }

    #[test]
    fn enable_flags_are_independent() {
        let setpoints = store();
        setpoints.set_aux12v_enabled(true);
        assert!(!setpoints.snapshot().hv_enabled);
        assert!(setpoints.snapshot().aux12v_enabled);
        setpoints.set_hv_enabled(true);
        setpoints.set_aux12v_enabled(false);
        assert!(setpoints.snapshot().hv_enabled);
        assert!(!setpoints.snapshot().aux12v_enabled);
    }

    #[test]
    fn persist_and_restore() {
        let setpoints = store();
        setpoints.set_targets(350.0, 9.0).unwrap();
        setpoints.set_end_current(0.5).unwrap();
        setpoints.set_hv_enabled(true);

        let mut settings = MemoryStore::new();
        setpoints.snapshot().persist(&mut settings).unwrap();

        let restored = store();
        restored.restore(&settings);
        assert_eq!(restored.snapshot(), setpoints.snapshot());
    }
}
