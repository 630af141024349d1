//! # Charger Emulator
//! This crate emulates the vehicle side of an on-board charger on one or more CAN buses. It decodes the charger's
//! proprietary frames into a normalized telemetry snapshot, drives the charger with the commanded setpoints from a
//! fixed 1 ms control loop supervised by a watchdog, and can replay captured CAN traces with their original timing.
//!
//! ## Example
//!
//! The following sets up a Chevy Volt charger on a virtual CAN channel, commands it, and runs the control loop.
//!
//! ```rust
//! use charger_emulator::can::{CanInterface, VirtualCan};
//! use charger_emulator::charger::ChargerType;
//! use charger_emulator::config::Config;
//! use charger_emulator::emulator::Emulator;
//!
//! async fn emulator_example() {
//!     let (driver, handle) = VirtualCan::new(CanInterface::NativeCan);
//!     let config = Config { charger_type: ChargerType::ChevyVolt, ..Config::default() };
//!
//!     let emulator = Emulator::builder(config)
//!         .driver(CanInterface::NativeCan, driver)
//!         .build(tokio::runtime::Handle::current())
//!         .unwrap();
//!
//!     emulator.setpoints().set_targets(380.0, 6.0).unwrap();
//!     emulator.setpoints().set_hv_enabled(true);
//!
//!     let running = emulator.start().unwrap();
//!     tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     for frame in handle.take_transmitted() {
//!         println!("0x{:03x}\t{}", frame.raw_id(), hex::encode(frame.data()));
//!     }
//!     running.shutdown();
//! }
//! ```
//!
//! ## Supported chargers
//!  - Chevy Volt Gen1 on-board charger
//!  - Nissan Leaf PDM
//!

pub mod can;
pub mod charger;
pub mod config;
pub mod connectivity;
pub mod emulator;
mod error;
pub mod events;
pub mod registry;
pub mod replay;
pub mod scheduler;
pub mod watchdog;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
