//! Interactive command language.
//!
//! The shell turns one line of input into a `Command`, runs it against a
//! `SessionContext` and returns the text to show. It never reads input or
//! prints anything itself; the REPL in `main.rs` owns the terminal.
//!
//! ```text
//! (monet) config --wavelength=561
//! (monet) calibrate --min=0 --max=90 --steps=10
//! (monet) set 4.5mW --tol 50uW
//! (monet) status
//! ```
//!
//! Option names may be abbreviated: an exact match wins, otherwise the
//! abbreviation must be contained in exactly one option name
//! (`--wave` -> `--wavelength`).

use crate::error::{AppResult, MonetError};
use crate::procedures::{SweepConfig, SweepResolution};
use crate::session::{ControlOverrides, SessionContext};
use crate::types::{format_power, is_power_unit, parse_power, Wavelength};
use std::time::Duration;

/// Scale applied to bare numbers in power arguments (milliwatts).
pub const DEFAULT_POWER_SCALE: f64 = 1e-3;

const CONFIG_OPTIONS: &[&str] = &["wavelength"];
const CALIBRATE_OPTIONS: &[&str] = &["min", "max", "steps", "step", "settle", "averages"];
const SET_OPTIONS: &[&str] = &["tolerance", "iterations", "duration"];
const HELP_TOPICS: &[&str] = &["config", "calibrate", "set", "status", "reload", "exit"];

/// Adjustments to the configured sweep for a single `calibrate`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SweepOverrides {
    /// First position (deg)
    pub min: Option<f64>,
    /// Last position (deg)
    pub max: Option<f64>,
    /// Subdivision of the range
    pub resolution: Option<SweepResolution>,
    /// Dwell after each move
    pub settle_time: Option<Duration>,
    /// Readings per position
    pub averages: Option<u32>,
}

impl SweepOverrides {
    /// Whether no override was given
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// `base` with every given override applied.
    pub fn apply(&self, base: &SweepConfig) -> SweepConfig {
        SweepConfig {
            min_position: self.min.unwrap_or(base.min_position),
            max_position: self.max.unwrap_or(base.max_position),
            resolution: self.resolution.unwrap_or(base.resolution),
            settle_time: self.settle_time.unwrap_or(base.settle_time),
            averages: self.averages.unwrap_or(base.averages),
            monotonic_tolerance: base.monotonic_tolerance,
            max_points: base.max_points,
        }
    }
}

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Select the working wavelength
    Config {
        /// Laser wavelength
        wavelength: Wavelength,
    },
    /// Run a calibration sweep
    Calibrate {
        /// Per-run sweep adjustments
        sweep: SweepOverrides,
    },
    /// Set the output power
    Set {
        /// Target power (W)
        target: f64,
        /// Per-run control adjustments
        overrides: ControlOverrides,
    },
    /// Show the session status
    Status,
    /// Re-read the calibration store file
    Reload,
    /// Show help, optionally for one command
    Help {
        /// Command to describe
        topic: Option<String>,
    },
    /// Leave the shell
    Exit,
}

/// What the driver should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutcome {
    /// Text to show the user
    pub message: String,
    /// Whether the shell should terminate
    pub exit: bool,
}

impl ShellOutcome {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit: false,
        }
    }
}

/// Resolve a possibly abbreviated `input` against `options`.
///
/// Exact matches win; otherwise `input` must be a substring of exactly one
/// option.
pub fn most_similar<'a>(input: &str, options: &[&'a str]) -> AppResult<&'a str> {
    if let Some(exact) = options.iter().find(|opt| **opt == input) {
        return Ok(*exact);
    }
    let partial: Vec<&'a str> = options
        .iter()
        .copied()
        .filter(|opt| !input.is_empty() && opt.contains(input))
        .collect();
    match partial.as_slice() {
        [only] => Ok(*only),
        [] => Err(MonetError::InvalidCommand(format!(
            "Unknown option '--{input}'. Expected one of: {}",
            options.join(", ")
        ))),
        several => Err(MonetError::InvalidCommand(format!(
            "Ambiguous option '--{input}': could be {}",
            several.join(", ")
        ))),
    }
}

/// Positional arguments and `--key=value` / `--key value` options of one line.
struct Arguments<'a> {
    positional: Vec<&'a str>,
    options: Vec<(&'static str, &'a str)>,
}

impl<'a> Arguments<'a> {
    fn parse(tokens: &[&'a str], known: &[&'static str]) -> AppResult<Self> {
        let mut positional = Vec::new();
        let mut options = Vec::new();
        let mut iter = tokens.iter().copied().peekable();

        while let Some(token) = iter.next() {
            let Some(option) = token.strip_prefix("--") else {
                positional.push(token);
                continue;
            };
            let (name, value) = match option.split_once('=') {
                Some((name, value)) => (name, value),
                None => {
                    let value = iter
                        .next_if(|next| !next.starts_with("--"))
                        .ok_or_else(|| {
                            MonetError::InvalidCommand(format!("Option '--{option}' needs a value"))
                        })?;
                    (option, value)
                }
            };
            options.push((most_similar(name, known)?, value));
        }

        Ok(Self {
            positional,
            options,
        })
    }

    fn no_positional(&self, command: &str) -> AppResult<()> {
        match self.positional.first() {
            Some(extra) => Err(MonetError::InvalidCommand(format!(
                "Unexpected argument '{extra}' for '{command}'"
            ))),
            None => Ok(()),
        }
    }
}

fn parse_number<T: std::str::FromStr>(option: &str, value: &str) -> AppResult<T> {
    value
        .parse()
        .map_err(|_| MonetError::InvalidCommand(format!("Invalid value '{value}' for --{option}")))
}

fn parse_duration(option: &str, value: &str) -> AppResult<Duration> {
    humantime_serde::re::humantime::parse_duration(value)
        .map_err(|e| MonetError::InvalidCommand(format!("Invalid duration for --{option}: {e}")))
}

impl Command {
    /// Parse one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> AppResult<Option<Self>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&name, rest)) = tokens.split_first() else {
            return Ok(None);
        };

        let command = match name.to_lowercase().as_str() {
            "config" => {
                let args = Arguments::parse(rest, CONFIG_OPTIONS)?;
                args.no_positional("config")?;
                let value = args
                    .options
                    .iter()
                    .find(|(key, _)| *key == "wavelength")
                    .map(|(_, value)| *value)
                    .ok_or_else(|| {
                        MonetError::InvalidCommand(
                            "Usage: config --wavelength=<nm>".to_string(),
                        )
                    })?;
                let nanometers: f64 = parse_number("wavelength", value.trim_end_matches("nm"))?;
                Command::Config {
                    wavelength: Wavelength::new(nanometers)?,
                }
            }
            "calibrate" => {
                let args = Arguments::parse(rest, CALIBRATE_OPTIONS)?;
                args.no_positional("calibrate")?;
                let mut sweep = SweepOverrides::default();
                for (key, value) in args.options {
                    match key {
                        "min" => sweep.min = Some(parse_number(key, value)?),
                        "max" => sweep.max = Some(parse_number(key, value)?),
                        "steps" => {
                            sweep.resolution = Some(SweepResolution::Steps(parse_number(key, value)?))
                        }
                        "step" => {
                            sweep.resolution =
                                Some(SweepResolution::StepSize(parse_number(key, value)?))
                        }
                        "settle" => sweep.settle_time = Some(parse_duration(key, value)?),
                        _ => sweep.averages = Some(parse_number(key, value)?),
                    }
                }
                Command::Calibrate { sweep }
            }
            "set" => {
                let args = Arguments::parse(rest, SET_OPTIONS)?;
                let power = match args.positional.as_slice() {
                    [value] => value.to_string(),
                    [value, unit] if is_power_unit(unit) => format!("{value}{unit}"),
                    [] => {
                        return Err(MonetError::InvalidCommand(
                            "Usage: set <power>[W|mW|uW|nW]".to_string(),
                        ))
                    }
                    tokens => {
                        return Err(MonetError::InvalidCommand(format!(
                            "Expected a single power value, got '{}'",
                            tokens.join(" ")
                        )))
                    }
                };
                let target = parse_power(&power, DEFAULT_POWER_SCALE)?;
                let mut overrides = ControlOverrides::default();
                for (key, value) in args.options {
                    match key {
                        "tolerance" => {
                            overrides.tolerance = Some(parse_power(value, DEFAULT_POWER_SCALE)?)
                        }
                        "iterations" => overrides.max_iterations = Some(parse_number(key, value)?),
                        _ => overrides.max_duration = Some(parse_duration(key, value)?),
                    }
                }
                Command::Set { target, overrides }
            }
            "status" => Command::Status,
            "reload" => Command::Reload,
            "help" | "?" => Command::Help {
                topic: rest.first().map(|t| t.to_lowercase()),
            },
            "exit" | "quit" | "q" => Command::Exit,
            other => {
                return Err(MonetError::InvalidCommand(format!(
                    "Unknown command '{other}'. Type 'help' for a list of commands"
                )))
            }
        };
        Ok(Some(command))
    }
}

/// Run `command` against the session.
pub async fn execute(ctx: &mut SessionContext, command: Command) -> AppResult<ShellOutcome> {
    let outcome = match command {
        Command::Config { wavelength } => {
            let state = ctx.config(wavelength).await?;
            ShellOutcome::message(format!("Wavelength set to {wavelength} nm ({state})"))
        }
        Command::Calibrate { sweep } => {
            let config = (!sweep.is_empty()).then(|| sweep.apply(&ctx.settings().sweep));
            let curve = ctx.calibrate(config).await?;
            let (min, max) = curve.power_range();
            let mut message = format!(
                "Calibrated {} nm: {} samples, {} .. {}",
                curve.wavelength(),
                curve.len(),
                format_power(min),
                format_power(max)
            );
            if curve.is_non_monotonic() {
                message.push_str(
                    "\nWarning: power is not monotonic in position; \
                     targets may be reachable at several positions",
                );
            }
            ShellOutcome::message(message)
        }
        Command::Set { target, overrides } => {
            let result = ctx.set(target, overrides).await?;
            let mut message = format!(
                "Power set to {} at {:.3} deg ({} iteration{}, {:.1?})",
                format_power(result.measured_power),
                result.position,
                result.iterations,
                if result.iterations == 1 { "" } else { "s" },
                result.elapsed
            );
            if result.ambiguous_lookup {
                message.push_str("\nNote: several positions give this power; used the nearest");
            }
            ShellOutcome::message(message)
        }
        Command::Status => ShellOutcome::message(ctx.status().await.to_string()),
        Command::Reload => {
            let curves = ctx.reload().await?;
            ShellOutcome::message(format!(
                "Reloaded {curves} calibration(s); session is {}",
                ctx.state()
            ))
        }
        Command::Help { topic } => ShellOutcome::message(help(topic.as_deref())?),
        Command::Exit => ShellOutcome {
            message: "Bye".to_string(),
            exit: true,
        },
    };
    Ok(outcome)
}

/// Help text for all commands or a single one.
pub fn help(topic: Option<&str>) -> AppResult<String> {
    let Some(topic) = topic else {
        return Ok([
            "Commands:",
            "  config --wavelength=<nm>       select the laser wavelength",
            "  calibrate [options]            sweep the attenuator and store a curve",
            "  set <power>[unit] [options]    drive the output to a power",
            "  status                         show wavelength, curve and actuator",
            "  reload                         re-read the calibration store file",
            "  help [command]                 show help",
            "  exit | quit | q                leave the shell",
            "Powers accept W, mW, uW and nW; bare numbers are mW.",
        ]
        .join("\n"));
    };

    let text = match most_similar(topic, HELP_TOPICS)? {
        "config" => {
            "config --wavelength=<nm>\n  Selects the power meter wavelength. Any previous curve is \
             dropped; a stored curve for the new wavelength is attached automatically when the \
             session allows it."
        }
        "calibrate" => {
            "calibrate [--min=<deg>] [--max=<deg>] [--steps=<n> | --step=<deg>] \
             [--settle=<duration>] [--averages=<n>]\n  Sweeps the attenuator over the range and \
             stores the measured curve for the current wavelength."
        }
        "set" => {
            "set <power>[unit] [--tolerance=<power>] [--iterations=<n>] [--duration=<duration>]\n  \
             Looks up the position for the power on the active curve, then corrects it with live \
             readings until within tolerance."
        }
        "status" => "status\n  Shows the session state, the active curve and the actuator position.",
        "reload" => "reload\n  Re-reads the calibration store file and re-attaches the current curve.",
        _ => "exit | quit | q\n  Leaves the shell.",
    };
    Ok(text.to_string())
}
