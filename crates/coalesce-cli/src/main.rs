#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

mod commands;
mod logging;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "coalesce")]
#[command(author, version, about = "Dev server that serves already-transformed modules as one cached bundle", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted logs
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the development server
    Dev {
        /// Entry module, relative to the project root
        #[arg(long, short = 'e', default_value = "src/main.js")]
        entry: PathBuf,

        /// Port to listen on (0 picks a free port)
        #[arg(long, short = 'p', default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "localhost")]
        host: String,

        /// Path to config file (defaults to coalesce.json in the project root)
        #[arg(long, short = 'c', value_name = "FILE")]
        config: Option<PathBuf>,

        /// Serve every module individually, without the cached bundle
        #[arg(long)]
        no_coalesce: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(cli.verbose, cli.json);

    let cwd = match cli.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().into_diagnostic()?,
    };

    match cli.command {
        Commands::Dev {
            entry,
            port,
            host,
            config,
            no_coalesce,
        } => {
            let action = commands::dev::DevAction {
                entry,
                cwd,
                port,
                host,
                config,
                no_coalesce,
            };

            let rt = tokio::runtime::Runtime::new().into_diagnostic()?;
            rt.block_on(commands::dev::run(action))
        }
    }
}
