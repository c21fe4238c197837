//! Commandline argument parsers for the binaries, using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Localize and explore with a fleet of robots
pub struct FleetArgs {
    #[command(subcommand)]
    /// Which task to perform
    pub command: CommandTask,

    /// RON file to read the mission configuration from. Defaults are used
    /// for anything it leaves out
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone)]
#[allow(missing_docs)]
pub enum CommandTask {
    /// Run a mission against the built-in fleet simulator
    #[command(about)]
    Simulate(SimulateCommand),

    /// Print a saved map as a probability matrix
    #[command(about)]
    Render(RenderCommand),
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
/// Options for a simulated mission
pub struct SimulateCommand {
    /// Number of robots to simulate; overrides the configured fleet size
    #[arg(short = 'n', long = "robots")]
    pub robots: Option<usize>,

    /// Localize the fleet acoustically before exploring, instead of
    /// starting from the true poses
    #[arg(short = 'l', long = "localize")]
    pub localize: bool,

    /// How long to explore for, in seconds
    #[arg(short = 'e', long = "explore", default_value_t = 10.0)]
    pub explore_secs: f64,

    /// Seed for frontier sampling and simulated noise
    #[arg(short = 's', long = "seed")]
    pub seed: Option<u64>,

    /// File to save the final map to, as RON
    #[arg(short = 'o', long = "out")]
    pub outfile: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
#[command(version, about)]
/// Options for rendering a saved map
pub struct RenderCommand {
    /// Map file written by `simulate --out`
    pub snapshot: PathBuf,
}

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Watch a map file in the terminal
pub struct MonitorArgs {
    /// Map file to watch; it is reloaded every tick
    pub snapshot: PathBuf,

    /// Milliseconds between reloads
    #[arg(short = 't', long = "tick", default_value_t = 250)]
    pub tick_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simulation() {
        let args = FleetArgs::parse_from([
            "echofleet",
            "simulate",
            "-n",
            "3",
            "--localize",
            "--explore",
            "2.5",
            "--out",
            "map.ron",
            "--config",
            "fleet.ron",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("fleet.ron")));
        let CommandTask::Simulate(cmd) = args.command else {
            panic!("expected simulate");
        };
        assert_eq!(cmd.robots, Some(3));
        assert!(cmd.localize);
        assert_eq!(cmd.explore_secs, 2.5);
        assert_eq!(cmd.seed, None);
        assert_eq!(cmd.outfile, Some(PathBuf::from("map.ron")));
    }

    #[test]
    fn parses_render_and_monitor() {
        let args = FleetArgs::parse_from(["echofleet", "render", "map.ron"]);
        assert!(matches!(args.command, CommandTask::Render(r) if r.snapshot == PathBuf::from("map.ron")));

        let monitor = MonitorArgs::parse_from(["monitor", "map.ron", "-t", "100"]);
        assert_eq!(monitor.tick_ms, 100);
    }
}
