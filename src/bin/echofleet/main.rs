//! Runs a mission against the fleet simulator, or renders a saved map.

use clap::Parser;
use echofleet::{
    args::{
        CommandTask::{Render, Simulate},
        FleetArgs, RenderCommand, SimulateCommand,
    },
    config::FleetConfig,
    grid::GridSnapshot,
    mission::Mission,
    reports::report_queues,
    simulator::SimulatedFleet,
    Pose, RobotId,
};
use log::{info, warn};
use std::error::Error;

// Example:
// cargo run --bin echofleet --
//                           simulate
//                           --robots   3
//                           --localize
//                           --explore  20
//                           --out      map.ron

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = FleetArgs::parse();

    let config = match &args.config {
        Some(path) => FleetConfig::from_path(path)?,
        None => FleetConfig::default(),
    };

    match args.command {
        Simulate(cmd) => simulate(config, cmd),
        Render(cmd) => render(cmd),
    }
}

/// Where robot `i` starts: the leader at the origin facing north, the rest
/// spread out in front of it.
fn start_pose(i: RobotId) -> Pose {
    if i == 0 {
        return Pose::default();
    }
    let side = if i % 2 == 0 { -1.0 } else { 1.0 };
    Pose::new(side * 40.0 * ((i + 1) / 2) as f64, 200.0, 0.0)
}

fn simulate(mut config: FleetConfig, cmd: SimulateCommand) -> Result<(), Box<dyn Error>> {
    if let Some(robots) = cmd.robots {
        config.fleet_size = robots;
    }
    if let Some(seed) = cmd.seed {
        config.exploration.seed = Some(seed);
        config.simulator.seed = Some(seed);
    }
    config.validate()?;
    let robots = config.fleet_size;

    let (sender, receivers) = report_queues(config.effective_queue_depth());
    let sim = SimulatedFleet::new(config.simulator.clone(), config.acoustics.clone(), sender);
    for i in 0..robots {
        // every robot's clock runs a little behind the last
        sim.add_robot(format!("sim-{}", i), start_pose(i), 37 * i as i64);
    }

    let mission = Mission::with_queues(config, sim, receivers)?;
    for (registration, received_at) in mission.link().registrations() {
        mission.register_at(&registration, received_at)?;
    }

    if cmd.localize {
        match mission.start_localization(robots)?.join() {
            Ok(Ok(placed)) => {
                for (id, at) in placed {
                    let truth = start_pose(id).position();
                    info!(
                        "robot {} placed at {}, truly at {} ({:.1} cm off)",
                        id,
                        at,
                        truth,
                        at.abs_dist(&truth)
                    );
                }
            }
            Ok(Err(error)) => warn!("localization failed: {}", error),
            Err(_) => return Err("localization thread panicked".into()),
        }
    } else {
        for id in 0..robots {
            mission.fleet().set_pose(id, start_pose(id));
        }
    }

    let snapshot = mission
        .start_exploration(cmd.explore_secs)?
        .join()
        .map_err(|_| "exploration thread panicked")?;
    println!("{}", snapshot);

    if let Some(outfile) = cmd.outfile {
        snapshot.to_path(&outfile)?;
        info!("saved map to {}", outfile.display());
    }
    Ok(())
}

fn render(cmd: RenderCommand) -> Result<(), Box<dyn Error>> {
    let snapshot = GridSnapshot::from_path(&cmd.snapshot)?;
    println!("{}", snapshot);
    Ok(())
}
