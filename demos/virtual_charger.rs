use std::time::Duration;

use charger_emulator::can::{CanInterface, Frame, Identifier, VirtualCan};
use charger_emulator::charger::ChargerType;
use charger_emulator::config::Config;
use charger_emulator::emulator::Emulator;
use tracing_subscriber;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let (driver, wire) = VirtualCan::new(CanInterface::AddonCan);
    let config = Config {
        charger_type: ChargerType::NissanLeaf,
        charger_interface: CanInterface::AddonCan,
        ..Config::default()
    };

    let emulator = Emulator::builder(config)
        .driver(CanInterface::AddonCan, driver)
        .build(tokio::runtime::Handle::current())
        .unwrap();
    emulator.setpoints().set_targets(390.0, 10.0).unwrap();
    emulator.setpoints().set_hv_enabled(true);

    let charger = emulator.charger().unwrap();
    let running = emulator.start().unwrap();

    // Play the PDM: wake up, then report 3.6 kW from a 230 V outlet.
    wire.inject(Frame::new(Identifier::Standard(0x679), &[0x00]).unwrap());
    for _ in 0..10 {
        wire.inject(Frame::new(Identifier::Standard(0x390), &[0x00, 36, 0x00, 0x20, 0x00, 0x04, 0x00, 0x00]).unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;

        for frame in wire.take_transmitted().iter().filter(|f| f.raw_id() != 0x50b) {
            println!("0x{:03x}\t{}", frame.raw_id(), hex::encode(frame.data()));
        }

        let charger = charger.lock().unwrap();
        println!(
            "{}: {:.0} W, {:.1} V, {:.2} A",
            charger.name(),
            charger.output_power_dc(),
            charger.hvdc_output_voltage(),
            charger.hvdc_output_current()
        );
    }

    println!("{} control cycles", running.control_cycles());
    running.shutdown();
}
