use std::sync::Arc;

use charger_emulator::can::{BusBuilder, CanInterface, InterfaceConfig, VirtualCan};
use charger_emulator::events::EventLog;
use charger_emulator::replay::Replayer;
use tracing_subscriber;

const SAMPLE: &str = "(0.000) can0 30E [1] 03
(0.030) can0 30E [1] 03
(0.050) can0 304 [4] 40 03 20 64
(0.060) can0 30E [1] 03
";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let trace = match std::env::args().nth(1) {
        Some(path) => std::fs::read_to_string(path).unwrap(),
        None => SAMPLE.to_string(),
    };

    let (driver, wire) = VirtualCan::new(CanInterface::NativeCan);
    let bus = BusBuilder::new(Arc::new(EventLog::new()))
        .attach(InterfaceConfig::native(CanInterface::NativeCan), driver)
        .unwrap()
        .build();

    let replayer = Replayer::new(Arc::new(bus), tokio::runtime::Handle::current());
    replayer.import_log(&trace);
    replayer.start(false, CanInterface::NativeCan).unwrap();
    replayer.wait().await;

    let sent = wire.take_transmitted_timed();
    let Some((start, _)) = sent.first().copied() else {
        println!("nothing replayed");
        return;
    };
    for (at, frame) in sent {
        println!(
            "{:>8.3}\t0x{:x}\t{}",
            (at - start).as_secs_f64(),
            frame.raw_id(),
            hex::encode(frame.data())
        );
    }
}
