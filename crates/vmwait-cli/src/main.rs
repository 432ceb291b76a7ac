mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};
use vmwait_core::{MAX_POLL_INTERVAL_SECS, MIN_POLL_INTERVAL_SECS, ProbePolicy};
use vmwait_qemu::VmwaitDirs;

#[derive(Parser)]
#[command(name = "vmwait")]
#[command(about = "Power QEMU VMs on or off and wait until they get there")]
#[command(version)]
struct Cli {
    /// Log debug output, including every power-state poll
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Shut a VM down and wait until it is powered off
    Stop {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Power a VM on and wait until it runs
    Start {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        wait: WaitArgs,
        /// Also wait until the guest reports an IP address
        #[arg(long)]
        wait_for_ip: bool,
        /// Also wait until guest customization has finished
        #[arg(long)]
        wait_for_customization: bool,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Name of the VM
    #[arg(required_unless_present_any = ["handle", "from_stdin"])]
    name: Option<String>,
    /// Server to look the name up on (defaults to `default_server` from settings)
    #[arg(short, long)]
    server: Option<String>,
    /// VM handle as `<server>/<id>`
    #[arg(long, conflicts_with_all = ["name", "from_stdin"])]
    handle: Option<String>,
    /// Read VM handles from stdin, one per line
    #[arg(long, conflicts_with = "name")]
    from_stdin: bool,
}

#[derive(Args)]
struct WaitArgs {
    /// Seconds between power-state polls
    #[arg(
        short,
        long,
        value_parser = clap::value_parser!(u64).range(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS)
    )]
    interval: Option<u64>,
    /// Give up after this many seconds
    #[arg(short, long)]
    timeout: Option<u64>,
    /// What to do when a guest probe fails
    #[arg(long, value_enum)]
    probe_policy: Option<PolicyArg>,
    /// Print the outcome as JSON
    #[arg(long)]
    pass_thru: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Retry,
    Escalate,
}

impl From<PolicyArg> for ProbePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Retry => ProbePolicy::Retry,
            PolicyArg::Escalate => ProbePolicy::Escalate,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(cli.verbose);

    match cli.command {
        Commands::Stop { target, wait } => {
            commands::stop(&target, &wait).await?;
        }
        Commands::Start {
            target,
            wait,
            wait_for_ip,
            wait_for_customization,
        } => {
            commands::start(&target, &wait, wait_for_ip, wait_for_customization).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    if let Ok(dirs) = VmwaitDirs::new()
        && std::fs::create_dir_all(dirs.logs_dir()).is_ok()
        && std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dirs.logs_dir().join("vmwait.log"))
            .is_ok()
    {
        let file_appender = rolling::never(dirs.logs_dir(), "vmwait.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking)
                    .with_filter(env_filter),
            )
            .with(console_layer(std::io::stderr, verbose))
            .init();
        return Some(guard);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
    None
}

/// Warnings always reach the terminal, even when the full log goes to a file.
fn console_layer<S, W>(writer: W, verbose: bool) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(writer)
        .with_filter(level)
}
