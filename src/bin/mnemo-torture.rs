//! Crash-injection scenario runner for the persistent-memory emulator and
//! the durable transaction engine.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::{Args, Parser, Subcommand, ValueEnum};
use mnemo::config::{LogKind, MnemoConfig};
use tracing_subscriber::{fmt, EnvFilter};

#[path = "mnemo-torture/scenarios.rs"]
mod scenarios;
#[path = "mnemo-torture/ui.rs"]
mod ui;

use scenarios::{CdfSummary, LogSummary, Options, RollbackSummary, StmSummary};
use ui::{Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "mnemo-torture",
    version,
    about = "Crash-injection scenarios for the mnemo persistent-memory emulator",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "MNEMO_CONFIG",
        help = "TOML config file (defaults to <config dir>/mnemo/config.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = 42, help = "Seed for the workload generator")]
    seed: u64,

    #[arg(long, global = true, default_value_t = 4, help = "Worker threads for the stm scenario")]
    threads: usize,

    #[arg(long, global = true, default_value_t = 200, help = "Rounds (or transfers per thread)")]
    iterations: u64,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for scenario reports"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, default_value_t = Theme::Auto, help = "Color theme")]
    theme: Theme,

    #[arg(long, global = true, help = "Plain output without progress bars")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write and flush random words, crash, and check the rollback.
    Crash,
    /// Histogram how many words of a dirty line survive a crash.
    Cdf(CdfCmd),
    /// Round-trip log records across a crash and check torn-tail detection.
    Log(LogCmd),
    /// Run concurrent transfer transactions, crash mid-run, recover and check
    /// the balance invariant.
    Stm,
}

#[derive(Args, Debug)]
struct CdfCmd {
    #[arg(long, help = "Replace the configured distribution with a uniform one")]
    uniform: bool,
}

#[derive(Args, Debug)]
struct LogCmd {
    #[arg(long, value_enum, help = "Only exercise this encoding")]
    kind: Option<LogKind>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn install_tracing(quiet: bool) {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let default = if quiet { "mnemo=warn" } else { "mnemo=info" };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Runs the selected scenario; returns whether it passed.
fn run() -> Result<bool, Box<dyn Error>> {
    let cli = Cli::parse();
    install_tracing(cli.quiet);
    let config = MnemoConfig::load(cli.config.clone())?;
    let ui = Ui::new(cli.theme, cli.quiet);
    let opts = Options {
        seed: cli.seed,
        threads: cli.threads,
        iterations: cli.iterations,
    };

    let passed = match cli.command {
        Command::Crash => {
            let summary = scenarios::crash(&config, &opts, &ui)?;
            emit(cli.format, &summary, || print_rollback(&ui, &summary))?;
            summary.violations == 0
        }
        Command::Cdf(cmd) => {
            let summary = scenarios::cdf(&config, &opts, cmd.uniform, &ui)?;
            emit(cli.format, &summary, || print_cdf(&ui, &summary))?;
            true
        }
        Command::Log(cmd) => {
            let summary = scenarios::log(&config, &opts, cmd.kind, &ui)?;
            emit(cli.format, &summary, || print_log(&ui, &summary))?;
            summary.violations() == 0
        }
        Command::Stm => {
            let summary = scenarios::stm(&config, &opts, &ui)?;
            emit(cli.format, &summary, || print_stm(&ui, &summary))?;
            summary.consistent
        }
    };
    Ok(passed)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_rollback(ui: &Ui, summary: &RollbackSummary) {
    ui.section(
        "Crash rollback",
        [
            ("rounds", summary.iterations),
            ("stores", summary.stores),
            ("flushed words", summary.flushed_words),
            ("rolled back", summary.rolled_back_words),
            ("evicted", summary.evicted_words),
            ("violations", summary.violations),
        ],
    );
    if summary.violations == 0 {
        ui.verdict(true, "every flushed word survived and nothing else leaked");
    } else {
        ui.verdict(false, &format!("{} words violated rollback", summary.violations));
    }
}

fn print_cdf(ui: &Ui, summary: &CdfSummary) {
    ui.section(
        "Partial crash distribution",
        [
            ("rounds", summary.iterations.to_string()),
            ("words per line", summary.words_per_line.to_string()),
            ("max deviation", format!("{:.4}", summary.max_deviation)),
        ],
    );
    ui.list(
        "Surviving words",
        summary.buckets.iter().map(|b| {
            format!(
                "{} words: expected {:.4} observed {:.4}",
                b.words, b.expected, b.observed
            )
        }),
    );
}

fn print_log(ui: &Ui, summary: &LogSummary) {
    for run in &summary.runs {
        ui.section(
            &format!("{} log", run.kind),
            [
                ("rounds", run.iterations),
                ("flushed records", run.flushed_records),
                ("recovered tail words", run.extra_words),
                ("torn recoveries", run.torn_recoveries),
                ("violations", run.violations),
            ],
        );
    }
    let violations = summary.violations();
    if violations == 0 {
        ui.verdict(true, "flushed records survived every crash");
    } else {
        ui.warn("inspect the torture.log.* warnings for the failing rounds");
        ui.verdict(false, &format!("{violations} rounds lost log data"));
    }
}

fn print_stm(ui: &Ui, summary: &StmSummary) {
    ui.section(
        "Transfers",
        [
            ("threads", summary.threads as u64),
            ("before crash", summary.transfers_before_crash),
            ("total", summary.transfers_total),
            ("restarts", summary.restarts),
            ("recovered units", summary.recovered_units),
        ],
    );
    ui.section(
        "Crash",
        [
            ("evicted lines", summary.crash_evicted_lines),
            ("restored bytes", summary.crash_restored_bytes),
        ],
    );
    let message = format!("balance sum {} (expected {})", summary.sum, summary.expected);
    ui.verdict(summary.consistent, &message);
}
