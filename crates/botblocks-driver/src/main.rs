use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use codespan_reporting::diagnostic::{Diagnostic, Label};
use codespan_reporting::term;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use botblocks_codegen::{compile, disassemble, emit_source, CompileOutput};
use botblocks_common::{FileId, RuntimeLimits, SourceDb};
use botblocks_graph::parse;
use botblocks_vm::{Hardware, SimHardware, Vm, VmState};

#[derive(Parser)]
#[command(name = "botblocks")]
#[command(about = "Block-program compiler for small robots")]
#[command(version)]
struct Cli {
    /// Target board; sets stack, step budget and track sizes
    #[arg(long, value_enum, default_value_t = Target::Avr, global = true)]
    target: Target,

    /// Program name used for emitted identifiers (default: the document's name)
    #[arg(long, global = true)]
    name: Option<String>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Avr,
    Esp32,
}

impl Target {
    fn limits(self) -> RuntimeLimits {
        match self {
            Target::Avr => RuntimeLimits::avr(),
            Target::Esp32 => RuntimeLimits::esp32(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and report slot counts and warnings
    Check {
        /// Block program (.json)
        source: PathBuf,
    },

    /// Print the bytecode listing
    Dump {
        source: PathBuf,

        /// Print the program as JSON instead
        #[arg(long)]
        json: bool,
    },

    /// Emit the C header with the program table and runtime
    Build {
        source: PathBuf,

        /// Output file path (default: the source with a .h extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the program against simulated hardware
    Simulate {
        source: PathBuf,

        /// Maximum number of scheduler ticks
        #[arg(long, default_value_t = 1000)]
        ticks: u64,

        /// Simulated milliseconds per tick
        #[arg(long, default_value_t = 10)]
        tick_ms: u64,

        /// Fixed sensor reading, e.g. `--sensor 0=75`
        #[arg(long, value_parser = parse_sensor)]
        sensor: Vec<(u8, f32)>,

        /// Request a stop at this simulated time
        #[arg(long)]
        stop_at: Option<u64>,
    },
}

impl Commands {
    fn source(&self) -> &Path {
        match self {
            Commands::Check { source }
            | Commands::Dump { source, .. }
            | Commands::Build { source, .. }
            | Commands::Simulate { source, .. } => source,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let path = cli.command.source().to_path_buf();
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut files = SourceDb::new();
    let file_id = files.add(path.display().to_string(), source.clone());

    let writer = StandardStream::stderr(ColorChoice::Auto);
    let config = term::Config::default();
    let emit = |diagnostic: &Diagnostic<FileId>| -> Result<()> {
        term::emit(&mut writer.lock(), &config, &files, diagnostic)?;
        Ok(())
    };

    // Load
    let mut graph = match parse(&source) {
        Ok(g) => g,
        Err(e) => {
            let diagnostic = Diagnostic::error()
                .with_message(&e.message)
                .with_labels(vec![
                    Label::primary(file_id, e.span.to_range()).with_message(&e.message)
                ]);
            emit(&diagnostic)?;
            std::process::exit(1);
        }
    };
    if let Some(name) = &cli.name {
        graph.name = name.clone();
    }

    // Compile
    let limits = cli.target.limits();
    let output = match compile(&graph, &limits) {
        Ok(o) => o,
        Err(e) => {
            emit(&Diagnostic::error().with_message(e.to_string()))?;
            std::process::exit(1);
        }
    };
    for diag in output.to_diagnostics(file_id) {
        emit(&diag)?;
    }

    match cli.command {
        Commands::Check { .. } => print_summary(&path, &output, &limits),
        Commands::Dump { json, .. } => {
            if json {
                let text = serde_json::to_string_pretty(&output.program)
                    .context("failed to serialize program")?;
                println!("{text}");
            } else {
                print!("{}", disassemble(&output.program));
            }
        }
        Commands::Build { output: out, .. } => {
            let out = out.unwrap_or_else(|| path.with_extension("h"));
            let text = emit_source(&output.program, &graph.name, &limits);
            std::fs::write(&out, text)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Wrote {}", out.display());
        }
        Commands::Simulate {
            ticks,
            tick_ms,
            sensor,
            stop_at,
            ..
        } => simulate(output, limits, ticks, tick_ms, &sensor, stop_at),
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `info`, raised by `-v`.
fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(path: &Path, output: &CompileOutput, limits: &RuntimeLimits) {
    let program = &output.program;
    let slots = program.slots();
    println!("OK: {} ({})", path.display(), program.name());
    println!("  instructions: {}", program.len());
    println!("  variables:    {}", slots.variables);
    println!(
        "  controllers:  pid {}, smooth {}, schmitt {}, edge {}",
        slots.pid, slots.smooth, slots.schmitt, slots.edge
    );
    println!(
        "  stack depth:  {} of {}",
        output.max_stack_depth, limits.stack_capacity
    );
    if !output.warnings.is_empty() {
        println!("  warnings:     {}", output.warnings.len());
    }
}

fn simulate(
    output: CompileOutput,
    limits: RuntimeLimits,
    ticks: u64,
    tick_ms: u64,
    sensors: &[(u8, f32)],
    stop_at: Option<u64>,
) {
    let mut hw = SimHardware::new();
    for &(channel, value) in sensors {
        hw.set_sensor(channel, value);
    }
    let mut vm = Vm::new(output.program, limits);

    let mut printed = 0;
    for _ in 0..ticks {
        if stop_at.is_some_and(|at| hw.now_ms() >= at) {
            vm.request_stop();
        }
        vm.tick(&mut hw);
        for call in &hw.drives()[printed..] {
            let [m1, m2, m3, m4] = call.motors;
            println!(
                "{:>8} ms  drive({m1:7.2}, {m2:7.2}, {m3:7.2}, {m4:7.2})",
                call.at_ms
            );
        }
        printed = hw.drives().len();
        if vm.is_halted() {
            break;
        }
        hw.advance(tick_ms);
    }

    match vm.state() {
        VmState::Halted => info!(at_ms = hw.now_ms(), "halted"),
        state => info!(
            at_ms = hw.now_ms(),
            ?state,
            pc = vm.pc(),
            action = ?vm.active_action(),
            "still running after {ticks} ticks"
        ),
    }
}

fn parse_sensor(arg: &str) -> std::result::Result<(u8, f32), String> {
    let (channel, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected CH=VALUE, got '{arg}'"))?;
    let channel: u8 = channel
        .trim()
        .parse()
        .map_err(|_| format!("bad sensor channel '{channel}'"))?;
    if channel as usize >= botblocks_common::SENSOR_COUNT {
        return Err(format!(
            "sensor channel {channel} out of range 0..{}",
            botblocks_common::SENSOR_COUNT
        ));
    }
    let value: f32 = value
        .trim()
        .parse()
        .map_err(|_| format!("bad sensor value '{value}'"))?;
    Ok((channel, value))
}
