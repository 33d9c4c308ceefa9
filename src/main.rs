use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use stackjit::config::{JitMode, OnFault, RuntimeConfig, Target};
use stackjit::samples::{self, Sample};
use stackjit::vm::{ExecContext, Runtime, VmError};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TargetArg {
    Host,
    #[value(name = "x86_64-sysv")]
    X86_64Sysv,
    #[value(name = "x86_64-win64")]
    X86_64Win64,
    Aarch64,
}

impl From<TargetArg> for Target {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Host => Target::Host,
            TargetArg::X86_64Sysv => Target::X86_64Sysv,
            TargetArg::X86_64Win64 => Target::X86_64Win64,
            TargetArg::Aarch64 => Target::Aarch64,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "stackjit")]
#[command(about = "A stack bytecode VM with a per-method JIT", long_about = None)]
struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overrides the config file and RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in sample program
    Run {
        sample: String,

        /// JIT compilation mode (off, on, auto)
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,

        /// JIT compilation threshold (number of calls before JIT)
        #[arg(long)]
        jit_threshold: Option<u32>,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,

        /// Result format
        #[arg(long, value_enum, default_value = "human")]
        format: FormatArg,
    },
    /// Print the machine code generated for every method of a sample
    Dump {
        sample: String,

        /// Code generation target
        #[arg(long, value_enum, default_value = "host")]
        target: TargetArg,
    },
    /// List the built-in samples
    List,
}

#[derive(Serialize)]
struct RunReport<'a> {
    sample: &'a str,
    jit: JitMode,
    stack: Option<Vec<i64>>,
    fault: Option<String>,
    status: Option<i64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match RuntimeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => RuntimeConfig::default(),
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    init_logging(&config);

    match cli.command {
        Commands::Run {
            sample,
            jit,
            jit_threshold,
            trace_jit,
            format,
        } => {
            let Some(sample) = find_sample(&sample) else {
                return ExitCode::FAILURE;
            };
            if let Some(mode) = jit {
                config.jit_mode = mode.into();
            }
            if let Some(threshold) = jit_threshold {
                config.jit_threshold = threshold;
            }
            config.trace_jit |= trace_jit;
            run_sample(sample, config, format)
        }
        Commands::Dump { sample, target } => {
            let Some(sample) = find_sample(&sample) else {
                return ExitCode::FAILURE;
            };
            dump_sample(sample, target.into())
        }
        Commands::List => {
            for sample in samples::SAMPLES {
                println!("{:<12} {}", sample.name, sample.about);
            }
            ExitCode::SUCCESS
        }
    }
}

/// RUST_LOG wins over the configured level; `--log-level` wins over both.
fn init_logging(config: &RuntimeConfig) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if config.log_level == RuntimeConfig::default().log_level => filter,
        _ => EnvFilter::new(&config.log_level),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn find_sample(name: &str) -> Option<&'static Sample> {
    let found = samples::find(name);
    if found.is_none() {
        eprintln!("error: unknown sample '{}' (try `stackjit list`)", name);
    }
    found
}

fn run_sample(sample: &Sample, config: RuntimeConfig, format: FormatArg) -> ExitCode {
    let jit = config.jit_mode;
    let on_fault = config.on_fault;
    let result = execute(sample, config);

    match format {
        FormatArg::Human => match &result {
            Ok(stack) => println!("{:?}", stack),
            Err(e) => eprintln!("error: {}", e),
        },
        FormatArg::Json => {
            let report = RunReport {
                sample: sample.name,
                jit,
                stack: result.as_ref().ok().cloned(),
                fault: result.as_ref().err().map(|e| e.to_string()),
                status: result.as_ref().err().and_then(VmError::status),
            };
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{}", json),
                Err(e) => {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    }

    match (result, on_fault) {
        (Ok(_), _) | (Err(_), OnFault::Halt) => ExitCode::SUCCESS,
        (Err(_), OnFault::Exit) => ExitCode::FAILURE,
    }
}

fn execute(sample: &Sample, config: RuntimeConfig) -> Result<Vec<i64>, VmError> {
    let runtime = Runtime::new(sample.program(), config)?;
    let entry = runtime
        .program()
        .entry_method()
        .cloned()
        .ok_or(VmError::InvalidMethod {
            class: 0,
            method: 0,
            trace: Vec::new(),
        })?;
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    let result = ctx.run(&entry, &[]);
    if let Err(e) = &result {
        runtime.report_fault(e);
    }
    result
}

#[cfg(feature = "jit")]
fn dump_sample(sample: &Sample, target: Target) -> ExitCode {
    let program = sample.program();
    for listing in stackjit::jit::dump(&program, target) {
        println!("{}:", listing.method);
        match listing.code {
            Ok(code) => print!("{}", stackjit::jit::hex_listing(&code)),
            Err(reason) => println!("  not compiled: {}", reason),
        }
    }
    ExitCode::SUCCESS
}

#[cfg(not(feature = "jit"))]
fn dump_sample(_sample: &Sample, _target: Target) -> ExitCode {
    eprintln!("error: built without the `jit` feature");
    ExitCode::FAILURE
}
