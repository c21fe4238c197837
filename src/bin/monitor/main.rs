mod gui;

use clap::Parser;
use echofleet::args::MonitorArgs;
use std::time::Duration;

fn main() {
    env_logger::init();
    let args = MonitorArgs::parse();
    if let Err(error) = gui::watch(args.snapshot, Duration::from_millis(args.tick_ms)) {
        eprintln!("{}", error);
    }
}
