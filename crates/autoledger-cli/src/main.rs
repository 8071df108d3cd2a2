use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = autoledger_cli::Cli::parse();
    autoledger_cli::init_tracing();
    autoledger_cli::run_cli(cli)
}
