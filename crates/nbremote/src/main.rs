use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kernel_session::{ServerConfig, ServerFlavor};

mod commands;
mod render;

#[derive(Parser)]
#[command(author, version, about = "Work with notebooks on a remote notebook server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server address: host:port or an http(s) URL
    #[arg(
        long,
        global = true,
        env = "NBREMOTE_SERVER",
        default_value = "localhost:8888"
    )]
    server: String,

    /// Login password
    #[arg(long, global = true, env = "NBREMOTE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Prompt for the login password
    #[arg(long, global = true, conflicts_with = "password")]
    ask_password: bool,

    /// Talk to a server that predates the contents API
    #[arg(long, global = true)]
    legacy: bool,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List notebooks on the server
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Create a new notebook and print its id
    New,
    /// Print a notebook's cells and saved outputs
    Show {
        notebook: String,
        /// Print the notebook document as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run cells in a fresh kernel and print their outputs
    Run {
        notebook: String,
        /// Cell index to run; repeat for several. Defaults to every code cell
        #[arg(long = "cell")]
        cells: Vec<usize>,
        /// Save the notebook with the new outputs
        #[arg(long)]
        save: bool,
        /// Give up on a cell after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Execute a snippet in the notebook's kernel
    Exec { notebook: String, code: String },
    /// Print completion candidates for a line of code
    Complete {
        notebook: String,
        line: String,
        /// Cursor position in characters; defaults to the end of the line
        #[arg(long)]
        cursor: Option<usize>,
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
    /// Write a notebook to a local file
    Export {
        notebook: String,
        file: PathBuf,
        /// Write plain text instead of nbformat JSON
        #[arg(long)]
        text: bool,
    },
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = ServerConfig::new(&self.server)?;
        if self.legacy {
            config = config.with_flavor(ServerFlavor::Legacy);
        }
        let password = if self.ask_password {
            Some(rpassword::prompt_password("Password: ")?)
        } else {
            self.password.clone()
        };
        if let Some(password) = password {
            config = config.with_password(password);
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let session = commands::connect(cli.server_config()?)?;
    match cli.command {
        Commands::List { json } => commands::list(&session, json),
        Commands::New => commands::new(&session),
        Commands::Show { notebook, json } => commands::show(&session, &notebook, json),
        Commands::Run {
            notebook,
            cells,
            save,
            timeout_secs,
        } => commands::run(
            session,
            &notebook,
            commands::RunOptions {
                cells,
                save,
                timeout: timeout_secs.map(Duration::from_secs),
            },
        ),
        Commands::Exec { notebook, code } => commands::exec(session, &notebook, &code),
        Commands::Complete {
            notebook,
            line,
            cursor,
            timeout_ms,
        } => commands::complete(
            session,
            &notebook,
            &line,
            cursor,
            Duration::from_millis(timeout_ms),
        ),
        Commands::Export {
            notebook,
            file,
            text,
        } => commands::export(&session, &notebook, &file, text),
    }
}
