use clap::{Parser, Subcommand};

mod commands;
mod scenario;

#[derive(Parser)]
#[command(
    name = "fleetsim",
    about = "FleetGrid node allocation simulator",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Emit logs as JSON lines instead of text
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario and print the fleet after every step.
    ///
    /// The scenario file is a fleet.toml (flavors, hosts, allocation
    /// policy) with an additional list of `[[steps]]`.
    Run {
        /// Scenario file
        #[arg(short, long)]
        scenario: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Print the flavor catalog declared by a fleet.toml
    Flavors {
        #[arg(short, long, default_value = "fleet.toml")]
        config: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("fleetsim=info".parse()?);
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Run { scenario, format } => commands::run::run(&scenario, &format),
        Commands::Flavors { config, format } => commands::flavors::list(&config, &format),
    }
}
