//! fleetctl: operator CLI for the botfleet daemon.
//!
//! Every subcommand is a single request over the daemon socket
//! (`~/.botfleet/daemon.sock`, or `BOTFLEET_SOCKET`). Replies are rendered as
//! tables or text; `--json` prints the raw payload instead.

mod commands;
mod daemon_client;
mod logging;

use clap::Parser;
use std::io::Read;

use commands::Commands;

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Control the botfleet daemon")]
#[command(version)]
struct Cli {
    /// Print the daemon's JSON payload instead of formatted output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    if let Err(err) = run(&cli) {
        tracing::error!(error = %err, "fleetctl command failed");
        eprintln!("fleetctl: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let (method, params) = commands::request_for(&cli.command, read_stdin)?;
    let data = daemon_client::call(method, params)?;

    if cli.json {
        let pretty = serde_json::to_string_pretty(&data)
            .map_err(|err| format!("Failed to format response: {}", err))?;
        println!("{}", pretty);
    } else {
        println!("{}", commands::render(method, &data));
    }
    Ok(())
}

fn read_stdin() -> Result<String, String> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|err| format!("Failed to read stdin: {}", err))?;
    Ok(input)
}
