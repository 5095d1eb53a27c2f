//! Ticket Desk CLI - provisioning and scripted runs.
//!
//! # Usage
//!
//! ```bash
//! # Hash a password for a user directory entry
//! td-cli hash-password --password 'correct-horse'
//!
//! # Validate a user directory file
//! td-cli users check users.yaml
//!
//! # Run the customer/support scenario against an in-memory engine
//! td-cli demo
//! td-cli demo --users users.yaml --password 'correct-horse'
//! ```
//!
//! # Commands
//!
//! - `hash-password` - Produce an Argon2id hash for provisioning
//! - `users check` - Parse and validate a YAML user directory
//! - `demo` - Walk through create, assign and delete with three live viewers
//!
//! # Environment Variables
//!
//! - `TICKET_DESK_LOG_JSON` - Emit JSON logs instead of text
//! - `TICKET_DESK_USERS_FILE` - Default directory file for `demo`
//! - `RUST_LOG` - Log filter (default `ticket_desk_engine=info,td_cli=info`)

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "td-cli")]
#[command(author, version, about = "Ticket Desk CLI tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hash a password with Argon2id
    HashPassword {
        /// Plain-text password (at least 8 characters)
        #[arg(short, long)]
        password: String,
    },
    /// Manage user directory files
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },
    /// Run the end-to-end scenario against an in-memory engine
    Demo {
        /// YAML user directory; defaults to `TICKET_DESK_USERS_FILE`, then to
        /// built-in accounts
        #[arg(short, long)]
        users: Option<PathBuf>,

        /// Password shared by the scenario accounts in `--users`
        #[arg(short, long)]
        password: Option<String>,
    },
}

#[derive(Subcommand)]
enum UsersAction {
    /// Parse and validate a user directory file
    Check {
        /// Path to the YAML file
        file: PathBuf,
    },
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ticket_desk_engine=info,td_cli=info".into());

    let use_json = std::env::var("TICKET_DESK_LOG_JSON").is_ok();
    let json_layer = use_json.then(|| tracing_subscriber::fmt::layer().json().flatten_event(true));
    let text_layer = (!use_json).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::HashPassword { password } => {
            commands::password::hash(&SecretString::from(password))?;
        }
        Commands::Users { action } => match action {
            UsersAction::Check { file } => commands::users::check(&file)?,
        },
        Commands::Demo { users, password } => {
            commands::demo::run(users, password.map(SecretString::from)).await?;
        }
    }
    Ok(())
}
