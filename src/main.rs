//! Stage joystick - command-line front end.
//!
//! Drives a dry-run stage from the MJC3 hand controller (or the keyboard
//! simulation), and exposes the probing and calibration tools.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use stage_joystick::axis::Axis;
use stage_joystick::calibration_store;
use stage_joystick::device::native::{HidAccess, NativeCommand};
use stage_joystick::device::simulated::KeyPress;
use stage_joystick::{
    ControllerFactory, ControllerKind, DryRunStage, JoystickController, PollingConfig,
    SimulatedKeypad,
};

#[derive(Parser)]
#[command(name = "stage-joystick", about = "Joystick control for a microscope Z/X/Y stage")]
struct Args {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List controller kinds and whether they can be used
    List,
    /// Instantiate, connect and release one controller kind
    Test { kind: ControllerKind },
    /// Run one native HID command: test, info, read or close
    Probe {
        command: NativeCommand,
        /// Timeout for `read`
        #[arg(long, default_value_t = 100)]
        timeout_ms: u32,
    },
    /// Drive a dry-run stage from the controller
    Run(RunArgs),
    /// Capture one axis calibration and save it
    Calibrate(CalibrateArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Preferred controller kind (hid or simulation)
    #[arg(long)]
    kind: Option<ControllerKind>,

    /// Microns per full deflection, all axes
    #[arg(long, default_value_t = 5.0)]
    step_factor: f64,

    /// Override the Z step factor
    #[arg(long)]
    z_step_factor: Option<f64>,

    /// Poll at 20 Hz instead of 50 Hz
    #[arg(long)]
    legacy_rate: bool,

    /// Calibration file to load
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Stop after this many seconds (default: until Ctrl-C)
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(clap::Args)]
struct CalibrateArgs {
    axis: Axis,

    /// Samples to capture while sweeping the axis
    #[arg(long, default_value_t = 200)]
    samples: usize,

    /// Calibration file to update
    #[arg(long, default_value = "joystick_calibration.json")]
    output: PathBuf,

    /// Preferred controller kind (hid or simulation)
    #[arg(long)]
    kind: Option<ControllerKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match args.command {
        Command::List => {
            let rows = ControllerFactory::new().list_available_kinds();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Test { kind } => {
            if !ControllerFactory::new().test_controller(kind) {
                bail!("{kind} controller test failed");
            }
            println!("{kind}: ok");
        }
        Command::Probe {
            command,
            timeout_ms,
        } => {
            let command = match command {
                NativeCommand::Read { .. } => NativeCommand::Read { timeout_ms },
                other => other,
            };
            let mut access = HidAccess::load()?;
            println!("{}", access.dispatch(command)?);
        }
        Command::Run(run_args) => run(run_args).await?,
        Command::Calibrate(cal_args) => calibrate(cal_args)?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = if args.legacy_rate {
        PollingConfig::legacy()
    } else {
        PollingConfig::default()
    };

    let stage = Arc::new(DryRunStage::new());
    let mut controller = ControllerFactory::new()
        .with_polling(config)
        .create_controller(stage.clone(), args.step_factor, args.kind)?;

    if let Some(path) = &args.calibration {
        controller.restore_calibration(calibration_store::load(path)?)?;
    }
    if let Some(z_step) = args.z_step_factor {
        controller.set_step_factor(Some(Axis::Z), z_step)?;
    }

    controller.start()?;
    if let Some(keypad) = controller.keypad() {
        spawn_keypad_reader(keypad)?;
    }

    wait_for_exit(&controller, args.duration_secs).await;

    controller.dispose();
    println!("{}", serde_json::to_string_pretty(&controller.state())?);
    let position = stage.position();
    info!(
        "Final dry-run position: X {:.2} um, Y {:.2} um, Z {:.2} um",
        position.x, position.y, position.z
    );
    Ok(())
}

async fn wait_for_exit(controller: &JoystickController, duration_secs: Option<u64>) {
    let deadline = duration_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down...");
                return;
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if !controller.is_running() {
                    warn!("[JOY] Controller stopped after a device fault");
                    return;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return;
                }
            }
        }
    }
}

/// Feed stdin keys to the simulation. Runs on its own thread since stdin
/// reads block; it dies with the process.
fn spawn_keypad_reader(keypad: SimulatedKeypad) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("keypad-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { return };
                for key in line.chars().filter(|c| !c.is_whitespace()) {
                    match key.to_string().parse::<KeyPress>() {
                        Ok(press) => {
                            if !keypad.press(press) {
                                return;
                            }
                        }
                        Err(e) => warn!("[SIM] {e}"),
                    }
                }
            }
        })
        .context("spawning keypad reader")?;
    info!("[SIM] Type keys then Enter: a/d = X, s/w = Y, f/r (or -/+) = Z");
    Ok(())
}

fn calibrate(args: CalibrateArgs) -> anyhow::Result<()> {
    let stage = Arc::new(DryRunStage::new());
    let mut controller = ControllerFactory::new().create_controller(stage, 0.0, args.kind)?;

    if controller.kind() == ControllerKind::Simulation {
        warn!("[CAL] No hardware controller; capturing from the simulation will only see neutral frames");
    }
    if args.output.exists() {
        controller.restore_calibration(calibration_store::load(&args.output)?)?;
    }

    controller.calibrate_axis(args.axis, args.samples)?;
    calibration_store::save(&args.output, &controller.calibration())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&controller.calibration_status())?
    );
    controller.dispose();
    Ok(())
}
