mod session;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use sputter_control::hardware::discovery::{PortCandidate, sort_by_likelihood};
use sputter_control::types::{analog, digital, relays};
use sputter_control::{
    CancellationToken, Mode, ProcedureId, ProcedureOutcome, load_config_or_default,
    voltage_to_pressure_torr,
};

use crate::session::Session;

const ION_GAUGE_PULSE: Duration = Duration::from_secs(1);

/// Sputter chamber controller
#[derive(Parser, Debug)]
#[command(name = "sputter-ctl")]
#[command(about = "Safety interlocks and automated procedures for a magnetron sputtering chamber", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Serial port of the relay controller, skips discovery
    #[arg(short, long, value_name = "PORT", global = true)]
    port: Option<String>,

    /// Run against the built-in chamber simulator
    #[arg(long, global = true)]
    simulate: bool,

    /// Operator mode for manual relay commands
    #[arg(long, value_name = "MODE", default_value = "normal", global = true)]
    mode: Mode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports, most likely controller first
    Ports,
    /// Print the current system snapshot as JSON
    Status,
    /// Switch one relay by name
    Relay {
        name: String,
        #[arg(value_parser = parse_switch)]
        state: bool,
    },
    /// Run an automated procedure
    Run { procedure: ProcedureId },
    /// Poll inputs and print pressures until Ctrl+C
    Monitor,
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => Err(format!("expected on or off, got '{}'", other)),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = load_config_or_default(args.config.as_deref());
    if args.port.is_some() {
        config.serial.port = args.port.clone();
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.log_level.clone());
    initialize_logging(&log_level);

    if matches!(args.command, Commands::Ports) {
        list_ports();
        return Ok(());
    }

    let shutdown = setup_shutdown_handler()?;
    let session = Session::open(config, args.simulate)?;
    session.safety().set_mode(args.mode);

    match args.command {
        Commands::Ports => Ok(()),
        Commands::Status => print_status(&session),
        Commands::Relay { name, state } => switch_relay(&session, &name, state),
        Commands::Run { procedure } => run_procedure(&session, procedure, &shutdown),
        Commands::Monitor => monitor(&session, &shutdown),
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

/// Ctrl+C cancels the returned token
fn setup_shutdown_handler() -> Result<CancellationToken, ctrlc::Error> {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping...");
        token.cancel();
    })?;
    Ok(shutdown)
}

fn list_ports() {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            error!("Could not enumerate serial ports: {}", e);
            return;
        }
    };
    let candidates: Vec<PortCandidate> = ports.into_iter().map(PortCandidate::from).collect();
    let total = candidates.len();
    let ranked = sort_by_likelihood(candidates);
    for candidate in &ranked {
        println!(
            "{:<24} score {:>4}  {}",
            candidate.name,
            candidate.score(),
            candidate.description
        );
    }
    if ranked.len() < total {
        println!("({} input device(s) hidden)", total - ranked.len());
    }
}

fn print_status(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    session.poll_once();
    let snapshot = session.safety().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn switch_relay(session: &Session, name: &str, on: bool) -> Result<(), Box<dyn std::error::Error>> {
    session.poll_once();
    let check = session.safety().check_button_safety(name, false);
    if !check.allowed {
        return Err(format!("{} refused: {}", name, check.message).into());
    }
    if check.confirmation_required {
        let prompt = check
            .confirmation_message
            .unwrap_or_else(|| format!("Switch {} {}?", name, if on { "ON" } else { "OFF" }));
        if !confirm(&prompt)? {
            info!("{} left unchanged", name);
            return Ok(());
        }
    }

    let index = session
        .relays()
        .index(name)
        .ok_or_else(|| format!("unknown relay '{}'", name))?;
    // The ion gauge controller toggles on a pulse
    if name == relays::ION_GAUGE {
        if !session.link().set_relay(index, true) {
            return Err("controller did not confirm the ion gauge pulse".into());
        }
        std::thread::sleep(ION_GAUGE_PULSE);
        if !session.link().set_relay(index, false) {
            warn!("Ion gauge relay did not release after the pulse");
        }
        session.safety().set_relay_state(name, on);
        info!("Ion gauge toggled {}", if on { "ON" } else { "OFF" });
        return Ok(());
    }
    if session.link().set_relay(index, on) {
        session.safety().set_relay_state(name, on);
        info!("{} switched {}", name, if on { "ON" } else { "OFF" });
        Ok(())
    } else {
        Err(format!("controller did not confirm {}", name).into())
    }
}

fn run_procedure(
    session: &Session,
    procedure: ProcedureId,
    shutdown: &CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let _poller = session.start_poller();
    let supervisor = session.supervisor();

    let handle = if procedure == ProcedureId::Abort {
        supervisor.abort()
    } else {
        supervisor.start(procedure)?
    };
    info!("{} procedure running, Ctrl+C cancels", procedure);

    let mut cancel_sent = false;
    let outcome = loop {
        if let Some(outcome) = handle.wait_timeout(Duration::from_millis(200)) {
            break outcome;
        }
        if shutdown.is_cancelled() && !cancel_sent {
            supervisor.cancel();
            cancel_sent = true;
        }
    };

    let outcome = match outcome {
        ProcedureOutcome::AwaitingUserConfirmation(request) => {
            println!();
            println!("{}", request.message);
            if confirm("Arm is home and the transfer is finished?")? {
                supervisor.complete_load_unload()?
            } else {
                supervisor.cancel_load_unload();
                ProcedureOutcome::Cancelled
            }
        }
        other => other,
    };

    info!("System status: {}", session.safety().system_status());
    match outcome {
        ProcedureOutcome::Success => {
            info!("✓ {} procedure completed", procedure);
            Ok(())
        }
        ProcedureOutcome::Cancelled => {
            warn!("{} procedure cancelled", procedure);
            Ok(())
        }
        ProcedureOutcome::Failure(message) => {
            error!("✗ {}", message);
            Err(message.into())
        }
        ProcedureOutcome::AwaitingUserConfirmation(_) => Ok(()),
    }
}

fn monitor(session: &Session, shutdown: &CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let poller = session.start_poller();
    while shutdown.sleep(Duration::from_secs(1)) {
        let snapshot = session.safety().snapshot();
        let volts = snapshot.analog_inputs;
        println!(
            "{:<14} chamber {:.2e} Torr ({:.2} V)  load-lock {:.2} V  turbo {:>3.0}%  door {}  arm {}",
            snapshot.system_status,
            voltage_to_pressure_torr(volts[analog::CHAMBER_PRESSURE]),
            volts[analog::CHAMBER_PRESSURE],
            volts[analog::LOADLOCK_PRESSURE],
            poller.turbo_spin_percent(),
            if snapshot.digital_inputs[digital::DOOR_CLOSED] { "closed" } else { "open" },
            if snapshot.digital_inputs[digital::ARM_HOME] { "home" } else { "out" },
        );
        if poller.link_lost() {
            return Err("lost the relay controller".into());
        }
    }
    Ok(())
}

/// Ask a yes/no question on the terminal
fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}
