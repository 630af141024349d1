//! Startup configuration and the settings store it is read from.
//!
//! The settings store itself is an external key/value service; the emulator
//! reads it once at startup and only writes validated setpoints back.

use std::collections::HashMap;

use crate::can::{CanInterface, InterfaceConfig};
use crate::charger::ChargerType;
use crate::error::Error;
use crate::Result;

/// Settings keys are limited to 15 characters by the persistent store.
pub const MAX_KEY_LEN: usize = 15;

pub const KEY_CHARGER_TYPE: &str = "CHGTYPE";
pub const KEY_CHARGER_INTERFACE: &str = "CHGCOMM";
pub const KEY_REPLAY_INTERFACE: &str = "REPLAYIF";
pub const KEY_ADDON_CRYSTAL: &str = "CANFREQ";
pub const KEY_ADDON_FD_CRYSTAL: &str = "CANFDFREQ";
pub const KEY_FD_AS_CLASSIC: &str = "CANFDASCAN";
pub const KEY_MAX_CHARGE_CURRENT: &str = "MAXCHGA";

const DEFAULT_ADDON_CRYSTAL_MHZ: u32 = 16;
const DEFAULT_ADDON_FD_CRYSTAL_MHZ: u32 = 40;

/// Key/value settings store.
pub trait SettingsStore {
    fn get_u32(&self, key: &str) -> Option<u32>;
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn get_f32(&self, key: &str) -> Option<f32>;
    fn put_u32(&mut self, key: &str, value: u32) -> Result<()>;
    fn put_bool(&mut self, key: &str, value: bool) -> Result<()>;
    fn put_f32(&mut self, key: &str, value: f32) -> Result<()>;
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::Settings(format!("invalid key '{}'", key)));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum SettingValue {
    Bool(bool),
    U32(u32),
    F32(f32),
}

/// Settings kept in RAM only.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: HashMap<String, SettingValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, key: &str, value: SettingValue) -> Result<()> {
        check_key(key)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

impl SettingsStore for MemoryStore {
    fn get_u32(&self, key: &str) -> Option<u32> {
        match self.values.get(key)? {
            SettingValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    fn get_f32(&self, key: &str) -> Option<f32> {
        match self.values.get(key)? {
            SettingValue::F32(v) => Some(*v),
            SettingValue::U32(v) => Some(*v as f32),
            _ => None,
        }
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.put(key, SettingValue::U32(value))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.put(key, SettingValue::Bool(value))
    }

    fn put_f32(&mut self, key: &str, value: f32) -> Result<()> {
        self.put(key, SettingValue::F32(value))
    }
}

/// Settings persisted as a JSON object in a file. Every write rewrites the file.
#[cfg(feature = "serde")]
pub struct JsonFileStore {
    path: std::path::PathBuf,
    values: std::collections::BTreeMap<String, SettingValue>,
}

#[cfg(feature = "serde")]
impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| Error::Settings(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Default::default(),
            Err(e) => return Err(Error::Settings(e.to_string())),
        };
        Ok(Self { path, values })
    }

    fn put(&mut self, key: &str, value: SettingValue) -> Result<()> {
        check_key(key)?;
        self.values.insert(key.to_string(), value);
        let text = serde_json::to_string_pretty(&self.values).map_err(|e| Error::Settings(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| Error::Settings(e.to_string()))
    }
}

#[cfg(feature = "serde")]
impl SettingsStore for JsonFileStore {
    fn get_u32(&self, key: &str) -> Option<u32> {
        match self.values.get(key)? {
            SettingValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            SettingValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    fn get_f32(&self, key: &str) -> Option<f32> {
        match self.values.get(key)? {
            SettingValue::F32(v) => Some(*v),
            SettingValue::U32(v) => Some(*v as f32),
            _ => None,
        }
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.put(key, SettingValue::U32(value))
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.put(key, SettingValue::Bool(value))
    }

    fn put_f32(&mut self, key: &str, value: f32) -> Result<()> {
        self.put(key, SettingValue::F32(value))
    }
}

/// Everything the emulator reads from the settings store at startup.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    pub charger_type: ChargerType,
    pub charger_interface: CanInterface,
    pub replay_interface: CanInterface,
    pub addon_crystal_mhz: u32,
    pub addon_fd_crystal_mhz: u32,
    /// Run FD-capable controllers as classic CAN.
    pub fd_as_classic: bool,
    /// User limit on charge current, on top of the protocol maximum.
    pub max_charge_current: Option<f32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            charger_type: ChargerType::None,
            charger_interface: CanInterface::NativeCan,
            replay_interface: CanInterface::NativeCan,
            addon_crystal_mhz: DEFAULT_ADDON_CRYSTAL_MHZ,
            addon_fd_crystal_mhz: DEFAULT_ADDON_FD_CRYSTAL_MHZ,
            fd_as_classic: false,
            max_charge_current: None,
        }
    }
}

fn read_interface(store: &dyn SettingsStore, key: &'static str) -> Result<CanInterface> {
    match store.get_u32(key) {
        None => Ok(CanInterface::NativeCan),
        Some(value) => u8::try_from(value)
            .ok()
            .and_then(CanInterface::from_repr)
            .ok_or(Error::InvalidSetting { key, value }),
    }
}

impl Config {
    /// Read the configuration, falling back to defaults for missing keys.
    pub fn load(store: &dyn SettingsStore) -> Result<Config> {
        let defaults = Config::default();

        let charger_type = match store.get_u32(KEY_CHARGER_TYPE) {
            None => defaults.charger_type,
            Some(value) => u8::try_from(value)
                .ok()
                .and_then(ChargerType::from_repr)
                .ok_or(Error::InvalidSetting {
                    key: KEY_CHARGER_TYPE,
                    value,
                })?,
        };

        Ok(Config {
            charger_type,
            charger_interface: read_interface(store, KEY_CHARGER_INTERFACE)?,
            replay_interface: read_interface(store, KEY_REPLAY_INTERFACE)?,
            addon_crystal_mhz: store.get_u32(KEY_ADDON_CRYSTAL).unwrap_or(defaults.addon_crystal_mhz),
            addon_fd_crystal_mhz: store
                .get_u32(KEY_ADDON_FD_CRYSTAL)
                .unwrap_or(defaults.addon_fd_crystal_mhz),
            fd_as_classic: store.get_bool(KEY_FD_AS_CLASSIC).unwrap_or(defaults.fd_as_classic),
            max_charge_current: store.get_f32(KEY_MAX_CHARGE_CURRENT),
        })
    }

    /// Write the configuration to `store`, e.g. after the user changed it.
    pub fn save(&self, store: &mut dyn SettingsStore) -> Result<()> {
        store.put_u32(KEY_CHARGER_TYPE, self.charger_type as u32)?;
        store.put_u32(KEY_CHARGER_INTERFACE, self.charger_interface as u32)?;
        store.put_u32(KEY_REPLAY_INTERFACE, self.replay_interface as u32)?;
        store.put_u32(KEY_ADDON_CRYSTAL, self.addon_crystal_mhz)?;
        store.put_u32(KEY_ADDON_FD_CRYSTAL, self.addon_fd_crystal_mhz)?;
        store.put_bool(KEY_FD_AS_CLASSIC, self.fd_as_classic)?;
        if let Some(current) = self.max_charge_current {
            store.put_f32(KEY_MAX_CHARGE_CURRENT, current)?;
        }
        Ok(())
    }

    /// Channel configuration for `interface` under this configuration.
    pub fn interface_config(&self, interface: CanInterface) -> InterfaceConfig {
        let config = match interface {
            CanInterface::AddonCan => InterfaceConfig::addon(interface, self.addon_crystal_mhz),
            CanInterface::AddonCanFd => InterfaceConfig::addon(interface, self.addon_fd_crystal_mhz),
            _ => InterfaceConfig::native(interface),
        };
        config.fd_as_classic(self.fd_as_classic)
    }

    /// Interfaces something is configured to use, without duplicates.
    pub fn used_interfaces(&self) -> Vec<CanInterface> {
        let mut interfaces = vec![];
        if self.charger_type != ChargerType::None {
            interfaces.push(self.charger_interface);
        }
        if !interfaces.contains(&self.replay_interface) {
            interfaces.push(self.replay_interface);
        }
        interfaces
    }
}
