//! createbot - command line front end for the robot
//!
//! One-shot commands (sensor dump, timed moves, docking) and a `run` mode
//! that keeps the sensor and power services going until Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use createbot::{
    AuxiliaryBattery, Config, ConsoleTelemetry, DockingController, Motion, ObstacleMonitor,
    PowerService, RelayBoard, Robot, SensorService, ServiceScheduler, SysfsBattery,
    TelemetryPublisher, Transport,
};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "createbot")]
#[command(about = "Serial control, docking and power management for a Create robot")]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query every sensor once and print the frame as JSON
    Sensors,
    /// Make one timed move
    Drive {
        #[arg(value_enum)]
        direction: Direction,
        /// Drive forward without watching the bumpers
        #[arg(long = "unsafe")]
        no_obstacle_check: bool,
    },
    /// Drive into the dock
    Dock,
    /// Back out of the dock
    Undock,
    /// Run the sensor and power services until interrupted
    Run,
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Forward,
    Reverse,
    Left,
    Right,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("CREATEBOT_CONFIG").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    info!("Using config: {}", config_path);
    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;

    let transport = Transport::open(config.serial.port(), config.serial.baud(), config.serial.read_timeout())
        .with_context(|| format!("Failed to open robot link on {}", config.serial.port()))?;
    let robot = Robot::new(Arc::new(transport), config.motion.clone());
    let monitor = ObstacleMonitor::new(robot.clone(), &config.obstacle);
    let motion = Motion::new(robot.clone(), monitor);

    match args.command {
        Commands::Sensors => {
            let reading = robot.query_sensors().await.context("Sensor query failed")?;
            for invalid in &reading.invalid {
                warn!("{}", invalid);
            }
            let json = if args.pretty {
                serde_json::to_string_pretty(&reading.frame)?
            } else {
                serde_json::to_string(&reading.frame)?
            };
            println!("{}", json);
        }
        Commands::Drive { direction, no_obstacle_check } => {
            robot.control().await.context("Failed to take control")?;
            match direction {
                Direction::Forward => {
                    let outcome = motion.forward(!no_obstacle_check).await?;
                    info!("Forward finished: {:?}", outcome);
                }
                Direction::Reverse => motion.reverse().await?,
                Direction::Left => motion.left().await?,
                Direction::Right => motion.right().await?,
            }
        }
        Commands::Dock => {
            let mut docking = DockingController::new(motion, config.docking.clone());
            match docking.dock().await {
                Ok(report) => println!("{}", serde_json::to_string(&report)?),
                Err(e) => {
                    error!("Docking failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        Commands::Undock => motion.undock().await.context("Undock failed")?,
        Commands::Run => run_services(&config, robot, args.pretty).await?,
    }
    Ok(())
}

async fn run_services(config: &Config, robot: Robot, pretty: bool) -> Result<()> {
    robot.wake().await.context("Failed to wake robot")?;
    robot.control().await.context("Failed to take control")?;

    let telemetry: Arc<dyn TelemetryPublisher> = Arc::new(if pretty {
        ConsoleTelemetry::pretty()
    } else {
        ConsoleTelemetry::new()
    });

    let mut scheduler = ServiceScheduler::new();
    scheduler.register(Box::new(SensorService::new(
        robot.clone(),
        Arc::clone(&telemetry),
        config.services.sensor_interval(),
    )))?;

    let power = match &config.auxiliary.port {
        Some(port) => {
            let relay = RelayBoard::open(port, config.auxiliary.baud())
                .with_context(|| format!("Failed to open relay board on {}", port))?;
            let battery: Arc<dyn AuxiliaryBattery> =
                Arc::new(SysfsBattery::new(config.auxiliary.battery_path()));
            scheduler.register(Box::new(PowerService::new(
                robot.clone(),
                Arc::new(relay),
                Some(battery),
                Arc::clone(&telemetry),
                config.services.power_interval(),
            )))?;
            true
        }
        None => {
            warn!("No relay board configured, power management disabled");
            false
        }
    };

    scheduler.start(SensorService::NAME).await?;
    if power {
        // Let the sensor service fill the frame before acting on it
        tokio::time::sleep(config.services.startup_settle()).await;
        scheduler.start(PowerService::NAME).await?;
    }
    info!("Services running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down services");
    let stopped = scheduler.stop_all().await;
    robot.stop().await.context("Failed to stop robot")?;
    stopped.context("A service did not shut down cleanly")?;
    info!("Shutdown complete");
    Ok(())
}
