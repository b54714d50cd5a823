//! po-advisor: CLI binary for the phase-ordering advisor.
//!
//! Subcommands:
//! - serve   load a policy and answer a compiler over pipes or sockets
//! - export  write the portable policy graph and exit

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use po_core::{Config, Encoding, TargetArch, TransportMode};
use po_policy::{sample_state, write_export, MlpPolicy, PolicyOracle};
use po_serve::{InferenceDriver, EXPORT_SAMPLE_SEED};

fn print_help() {
    eprintln!(
        r#"po-advisor - phase-ordering advisor

USAGE:
    po-advisor <COMMAND> [OPTIONS]

COMMANDS:
    serve       Load a policy and serve advice to the compiler
    export      Export the policy as a portable graph file

OPTIONS:
    -h, --help          Print this help message
    -V, --version       Print version

Run `po-advisor <COMMAND> --help` for command options.
"#
    );
}

fn print_version() {
    println!("po-advisor {}", env!("CARGO_PKG_VERSION"));
}

/// Command-line values layered over the config file.
#[derive(Debug, Default, PartialEq)]
struct Overrides {
    config: Option<PathBuf>,
    model: Option<PathBuf>,
    aarch64: bool,
    alpha: Option<f64>,
    beta: Option<f64>,
    size_reward_thresh: Option<f64>,
    mca_reward_thresh: Option<f64>,
    mode: Option<TransportMode>,
    bind: Option<String>,
    encoding: Option<Encoding>,
    pipe_name: Option<String>,
    pipe_dir: Option<PathBuf>,
    export: bool,
    export_path: Option<PathBuf>,
    completion_log: Option<PathBuf>,
    events: Option<PathBuf>,
    command: Option<Vec<String>>,
}

enum Parsed {
    Help,
    Run(Overrides),
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("Missing value for {flag}"))
}

fn number(args: &[String], i: usize, flag: &str) -> Result<f64, String> {
    let v = value(args, i, flag)?;
    v.parse()
        .map_err(|_| format!("Invalid {flag} value: {v}"))
}

fn parse_args(args: &[String]) -> Result<Parsed, String> {
    let mut o = Overrides::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => return Ok(Parsed::Help),
            "--config" => {
                o.config = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--model" => {
                o.model = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--aarch64" | "--isAArch" => {
                o.aarch64 = true;
                i += 1;
            }
            "--alpha" => {
                o.alpha = Some(number(args, i, flag)?);
                i += 2;
            }
            "--beta" => {
                o.beta = Some(number(args, i, flag)?);
                i += 2;
            }
            "--size-reward-thresh" | "--size_reward_thresh" => {
                o.size_reward_thresh = Some(number(args, i, flag)?);
                i += 2;
            }
            "--mca-reward-thresh" | "--mca_reward_thresh" => {
                o.mca_reward_thresh = Some(number(args, i, flag)?);
                i += 2;
            }
            "--mode" => {
                o.mode = Some(value(args, i, flag)?.parse().map_err(|e| format!("{e}"))?);
                i += 2;
            }
            "--use-pipe" | "--use_pipe" => {
                o.mode = Some(TransportMode::Pipe);
                i += 1;
            }
            "--use-remote" | "--use_grpc" => {
                o.mode = Some(TransportMode::Remote);
                i += 1;
            }
            "--bind" => {
                o.bind = Some(value(args, i, flag)?.to_string());
                i += 2;
            }
            "--server-port" | "--server_port" => {
                let v = value(args, i, flag)?;
                let port: u16 = v.parse().map_err(|_| format!("Invalid {flag} value: {v}"))?;
                o.bind = Some(format!("tcp://127.0.0.1:{port}"));
                i += 2;
            }
            "--encoding" | "--data_format" => {
                o.encoding = Some(value(args, i, flag)?.parse().map_err(|e| format!("{e}"))?);
                i += 2;
            }
            "--pipe-name" | "--pipe_name" => {
                o.pipe_name = Some(value(args, i, flag)?.to_string());
                i += 2;
            }
            "--pipe-dir" => {
                o.pipe_dir = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--export" | "--export_onnx" => {
                o.export = true;
                i += 1;
            }
            "--export-path" | "--out" => {
                o.export_path = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--completion-log" => {
                o.completion_log = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--events" => {
                o.events = Some(PathBuf::from(value(args, i, flag)?));
                i += 2;
            }
            "--" => {
                let rest = args[i + 1..].to_vec();
                if rest.is_empty() {
                    return Err("Missing compiler command after --".to_string());
                }
                o.command = Some(rest);
                break;
            }
            other => return Err(format!("Unknown option: {other}")),
        }
    }
    Ok(Parsed::Run(o))
}

fn build_config(o: &Overrides) -> Result<Config, String> {
    let mut cfg = match (&o.config, &o.model) {
        (Some(p), _) => Config::load(p).map_err(|e| format!("Failed to load {}: {e}", p.display()))?,
        (None, Some(m)) => Config::with_checkpoint(m),
        (None, None) => return Err("One of --config or --model is required".to_string()),
    };
    if let Some(m) = &o.model {
        cfg.policy.checkpoint = m.clone();
    }
    if o.aarch64 {
        cfg.target = TargetArch::AArch64;
    }
    if let Some(v) = o.alpha {
        cfg.reward.alpha = v;
    }
    if let Some(v) = o.beta {
        cfg.reward.beta = v;
    }
    if let Some(v) = o.size_reward_thresh {
        cfg.reward.size_reward_thresh = v;
    }
    if let Some(v) = o.mca_reward_thresh {
        cfg.reward.mca_reward_thresh = v;
    }
    if let Some(m) = o.mode {
        cfg.transport.mode = m;
    }
    if let Some(b) = &o.bind {
        cfg.transport.bind = b.clone();
    }
    if let Some(e) = o.encoding {
        cfg.transport.encoding = e;
    }
    if let Some(n) = &o.pipe_name {
        cfg.transport.pipe_name = n.clone();
    }
    if let Some(d) = &o.pipe_dir {
        cfg.transport.pipe_dir = d.clone();
    }
    if o.export {
        cfg.export.enabled = true;
    }
    if let Some(p) = &o.export_path {
        cfg.export.path = p.clone();
    }
    if let Some(p) = &o.completion_log {
        cfg.logging.completion_log = p.clone();
    }
    if let Some(p) = &o.events {
        cfg.logging.events_path = Some(p.clone());
    }
    if let Some(c) = &o.command {
        cfg.transport.command = Some(c.clone());
    }
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

fn parse_or_exit(args: &[String], cmd: &str, usage: &str) -> Option<Config> {
    let o = match parse_args(args) {
        Ok(Parsed::Help) => {
            println!("{usage}");
            return None;
        }
        Ok(Parsed::Run(o)) => o,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("Run `po-advisor {cmd} --help` for usage.");
            process::exit(1);
        }
    };
    match build_config(&o) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    }
}

const SERVE_USAGE: &str = r#"po-advisor serve

USAGE:
    po-advisor serve (--config cfg.yaml | --model CKPT) [OPTIONS] [-- COMPILER ARGS...]

OPTIONS:
    --config PATH               YAML config
    --model PATH                Policy checkpoint (file or directory); overrides the config
    --aarch64                   Target AArch64 instead of X86
    --alpha X / --beta X        Reward weights for size / throughput
    --size-reward-thresh X      Ignore relative size changes below X
    --mca-reward-thresh X       Ignore relative throughput changes below X
    --mode pipe|remote          Transport (also --use-pipe / --use-remote)
    --bind ENDPOINT             tcp://host:port or unix:///path.sock (remote mode)
    --server-port N             Shorthand for --bind tcp://127.0.0.1:N
    --encoding json|binary|msgpack
    --pipe-name NAME            Pipe pair <dir>/<NAME>.in and .out (default: posetrl_pipe)
    --pipe-dir DIR              Directory holding the pipes
    --export                    Export the policy graph at startup
    --export-path PATH          Where to write the export
    --completion-log PATH       One line per completed unit (default: actionlist.txt)
    --events PATH               NDJSON event log
    -- CMD ARGS...              Spawn the compiler and talk over its stdin/stdout
"#;

const EXPORT_USAGE: &str = r#"po-advisor export

USAGE:
    po-advisor export (--config cfg.yaml | --model CKPT) [--out PATH]

OPTIONS:
    --config PATH     YAML config
    --model PATH      Policy checkpoint; overrides the config
    --out PATH        Output file (default: export.path from the config)
"#;

fn cmd_serve(args: &[String]) {
    let Some(cfg) = parse_or_exit(args, "serve", SERVE_USAGE) else {
        return;
    };
    let mode = cfg.transport.mode;
    let driver = InferenceDriver::new(cfg).unwrap_or_else(|e| {
        eprintln!("Failed to start advisor: {e}");
        process::exit(1);
    });
    eprintln!("[po-advisor] serving in {} mode", mode.as_str());
    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = driver.run(shutdown) {
        eprintln!("Advisor stopped: {e}");
        process::exit(1);
    }
}

fn cmd_export(args: &[String]) {
    let Some(cfg) = parse_or_exit(args, "export", EXPORT_USAGE) else {
        return;
    };
    let policy = MlpPolicy::load(&cfg.policy.checkpoint, &cfg.policy).unwrap_or_else(|e| {
        eprintln!("Failed to load policy: {e}");
        process::exit(1);
    });
    let sample = sample_state(policy.input_len(), EXPORT_SAMPLE_SEED);
    let res = policy
        .export_portable(&sample)
        .and_then(|bytes| write_export(&cfg.export.path, &bytes));
    match res {
        Ok(()) => println!("Exported policy graph to {}", cfg.export.path.display()),
        Err(e) => {
            eprintln!("Export failed: {e}");
            process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        process::exit(0);
    }

    match args[1].as_str() {
        "-h" | "--help" | "help" => {
            print_help();
        }
        "-V" | "--version" => {
            print_version();
        }
        "serve" => {
            cmd_serve(&args[2..]);
        }
        "export" => {
            cmd_export(&args[2..]);
        }
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            eprintln!("Run `po-advisor --help` for usage.");
            process::exit(1);
        }
    }
}
