use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use wiper_core::{WiperMode, WIPER_ROOT};

pub const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:55555";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing value for {0}")]
    MissingValue(String),
    #[error("invalid value '{value}' for {flag}: {reason}")]
    InvalidValue {
        flag: String,
        value: String,
        reason: String,
    },
    #[error("failed to load {path}: {reason}")]
    File { path: String, reason: String },
}

/// One set of actuator targets injected after start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetSet {
    pub mode: WiperMode,
    pub frequency: u32,
    pub position: f32,
}

impl FromStr for TargetSet {
    type Err = String;

    /// Parses `MODE,FREQ,POS`, e.g. `WIPE,50,20.0`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        let [mode, frequency, position] = parts.as_slice() else {
            return Err("expected MODE,FREQ,POS".to_string());
        };
        Ok(Self {
            mode: mode.parse::<WiperMode>().map_err(|e| e.to_string())?,
            frequency: frequency
                .parse::<u32>()
                .map_err(|e| format!("frequency: {e}"))?,
            position: position
                .parse::<f32>()
                .map_err(|e| format!("position: {e}"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub broker_addr: String,
    pub token: Option<String>,
    pub bus_app: Option<String>,
    pub bus_config: Option<PathBuf>,
    pub dummy_feeder: bool,
    pub publish_cycle: Duration,
    pub step_interval: Duration,
    pub sim_config: Option<PathBuf>,
    pub signal_root: String,
    pub set_target: Option<TargetSet>,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            broker_addr: DEFAULT_BROKER_ADDR.to_string(),
            token: None,
            bus_app: None,
            bus_config: None,
            dummy_feeder: false,
            publish_cycle: Duration::from_millis(100),
            step_interval: Duration::from_millis(10),
            sim_config: None,
            signal_root: WIPER_ROOT.to_string(),
            set_target: None,
            run_seconds: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args_and_env(&args, |key| std::env::var(key).ok())
    }

    /// Parses argv only; environment fallbacks are not consulted.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        Self::from_args_and_env(args, |_| None)
    }

    /// Environment values are read once here and overridden by flags.
    pub fn from_args_and_env<E>(args: &[String], env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut cfg = RuntimeConfig::default();
        if let Some(addr) = env("BROKER_ADDR") {
            cfg.broker_addr = addr;
        }
        cfg.token = env("BROKER_TOKEN").filter(|t| !t.is_empty());
        cfg.bus_app = env("BUS_APPLICATION_NAME").filter(|a| !a.is_empty());
        cfg.bus_config = env("BUS_CONFIGURATION")
            .filter(|c| !c.is_empty())
            .map(PathBuf::from);

        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--target" => cfg.broker_addr = value(args, &mut i)?.to_string(),
                "--token" => cfg.token = Some(value(args, &mut i)?.to_string()),
                "--bus-app" => cfg.bus_app = Some(value(args, &mut i)?.to_string()),
                "--bus-config" => cfg.bus_config = Some(PathBuf::from(value(args, &mut i)?)),
                "--dummy-feeder" => cfg.dummy_feeder = true,
                "--cycle" => {
                    cfg.publish_cycle = Duration::from_millis(parse(flag, value(args, &mut i)?)?)
                }
                "--step" => {
                    cfg.step_interval = Duration::from_millis(parse(flag, value(args, &mut i)?)?)
                }
                "--sim-config" => cfg.sim_config = Some(PathBuf::from(value(args, &mut i)?)),
                "--signal-root" => cfg.signal_root = value(args, &mut i)?.to_string(),
                "--set-target" => cfg.set_target = Some(parse(flag, value(args, &mut i)?)?),
                "--run-seconds" => cfg.run_seconds = Some(parse(flag, value(args, &mut i)?)?),
                "--json-logs" => cfg.json_logs = true,
                "--log-dir" => cfg.log_dir = Some(PathBuf::from(value(args, &mut i)?)),
                "--metrics-addr" => cfg.metrics_addr = Some(value(args, &mut i)?.to_string()),
                "--help" | "-h" => {
                    cfg.show_help = true;
                    return Ok(cfg);
                }
                other => {
                    return Err(ConfigError::InvalidValue {
                        flag: "argument".to_string(),
                        value: other.to_string(),
                        reason: "unknown option".to_string(),
                    })
                }
            }
            i += 1;
        }

        if cfg.step_interval >= cfg.publish_cycle {
            return Err(ConfigError::InvalidValue {
                flag: "--step".to_string(),
                value: cfg.step_interval.as_millis().to_string(),
                reason: "must be shorter than --cycle".to_string(),
            });
        }
        Ok(cfg)
    }

    /// True when both a bus application name and an existing bus
    /// configuration file are given and the dummy feeder was not forced.
    pub fn bus_enabled(&self) -> bool {
        !self.dummy_feeder
            && self.bus_app.is_some()
            && self.bus_config.as_ref().is_some_and(|p| p.is_file())
    }

    pub fn print_help() {
        println!(
            r#"wiper-adapter - Wiper service bus to signal aggregation bridge

USAGE:
    wiper-adapter [OPTIONS]

OPTIONS:
    --target <ADDR>         Aggregation service address [default: {DEFAULT_BROKER_ADDR}]
    --token <STR>           Bearer token presented to the aggregation service
    --bus-app <NAME>        Bus application name
    --bus-config <PATH>     Bus configuration file (JSON)
    --dummy-feeder          Skip the bus and push one synthetic ramp
    --cycle <MS>            Telemetry publish cycle [default: 100]
    --step <MS>             Simulator step interval [default: 10]
    --sim-config <PATH>     Simulator tuning file (JSON)
    --signal-root <PATH>    Signal root [default: {WIPER_ROOT}]
    --set-target <M,F,P>    Inject actuator targets after start (e.g. WIPE,50,20.0)
    --run-seconds <SECS>    Run for a fixed duration then exit
    --json-logs             Output logs in JSON format
    --log-dir <DIR>         Also write daily rolling log files to DIR
    --metrics-addr <ADDR>   Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    BROKER_ADDR             Aggregation service address
    BROKER_TOKEN            Bearer token
    BUS_APPLICATION_NAME    Bus application name
    BUS_CONFIGURATION       Bus configuration file
    RUST_LOG                Set log filter (e.g., RUST_LOG=debug,wiper_io=trace)

EXAMPLES:
    # Bus mode with metrics
    BUS_APPLICATION_NAME=wiper_adapter BUS_CONFIGURATION=bus.json \
        wiper-adapter --metrics-addr 0.0.0.0:9090

    # Exercise the actuator path for ten seconds
    wiper-adapter --bus-app wiper_adapter --bus-config bus.json \
        --set-target WIPE,50,20.0 --run-seconds 10
"#
        );
    }
}

/// Advances past the flag at `args[*i]` and returns its value.
fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, ConfigError> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| ConfigError::MissingValue(flag.clone()))
}

fn parse<T>(flag: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        flag: flag.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
