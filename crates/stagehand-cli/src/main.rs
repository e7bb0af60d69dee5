mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::eval::EvalArgs;
use commands::kernels::KillArgs;
use commands::reserve::ReserveSetArgs;
use commands::run::RunArgs;
use commands::sessions::DetachArgs;
use opts::GlobalOpts;

#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about = "Kernel orchestration daemon and client")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator daemon
    Run(RunArgs),

    /// Stop a running daemon
    Stop,

    /// List kernels known to the deployment provider
    Kernels,

    /// Kill a kernel by id
    Kill(KillArgs),

    /// Drop finished kernels and top up the reserve
    Flush,

    /// Inspect or change the reserve pool
    #[command(subcommand)]
    Reserve(ReserveCommand),

    /// List attached sessions
    Sessions,

    /// Shut a session's queue down
    Detach(DetachArgs),

    /// Evaluate code on a session's kernel
    Eval(EvalArgs),

    /// List available kernel types
    Catalog,
}

#[derive(Subcommand, Debug)]
enum ReserveCommand {
    /// Show the reserve configuration
    Get,

    /// Change the reserve size or shares
    Set(ReserveSetArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    match cli.command {
        Command::Run(args) => commands::run::cmd_run(opts, &args).await,
        Command::Stop => commands::stop::cmd_stop(opts).await,
        Command::Kernels => commands::kernels::cmd_kernels(opts).await,
        Command::Kill(args) => commands::kernels::cmd_kill(opts, &args).await,
        Command::Flush => commands::kernels::cmd_flush(opts).await,
        Command::Reserve(cmd) => match cmd {
            ReserveCommand::Get => commands::reserve::cmd_reserve_get(opts).await,
            ReserveCommand::Set(args) => commands::reserve::cmd_reserve_set(opts, &args).await,
        },
        Command::Sessions => commands::sessions::cmd_sessions(opts).await,
        Command::Detach(args) => commands::sessions::cmd_detach(opts, &args).await,
        Command::Eval(args) => commands::eval::cmd_eval(opts, &args).await,
        Command::Catalog => commands::catalog::cmd_catalog(opts).await,
    }
}
