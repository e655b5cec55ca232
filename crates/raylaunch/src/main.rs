mod cli;
mod paths;
mod run;
mod settings;

use anyhow::Result;
use cli::Command;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Devices) => run::list_devices(),
        Some(Command::Sbt) => run::describe_sbt(cli.run),
        None => run::run(cli.run),
    }
}
