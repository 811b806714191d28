//! iconwear: command-line client for the iconwear daemon.
//!
//! ## Subcommands
//!
//! - `launch`: report an application launch (path or bare id)
//! - `level`, `reconstructions`, `metrics`: query wear state
//! - `reset`: repair an application's icon
//! - `health`: daemon and engine status
//! - `watch`: stream wear notifications until interrupted

mod daemon_client;

use clap::{Parser, Subcommand};
use daemon_client::ClientError;
use iconwear_protocol::Method;
use serde_json::{json, Value};
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iconwear")]
#[command(about = "Query and drive the iconwear usage-wear daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report that an application was launched
    Launch {
        /// Desktop entry path or application id
        #[arg(value_name = "RESOURCE")]
        resource: String,

        /// Name of the launcher reporting the event
        #[arg(long)]
        agent: Option<String>,
    },

    /// Print the current wear level (0-100) of an application
    Level {
        #[arg(value_name = "APP_ID")]
        app_id: String,
    },

    /// Print usage metrics for one application, or all tracked applications
    Metrics {
        #[arg(value_name = "APP_ID")]
        app_id: Option<String>,
    },

    /// Reset an application's wear level
    Reset {
        #[arg(value_name = "APP_ID")]
        app_id: String,
    },

    /// Print how many times an application has been reset
    Reconstructions {
        #[arg(value_name = "APP_ID")]
        app_id: String,
    },

    /// Print daemon health
    Health,

    /// Print wear notifications as they happen
    Watch,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run(cli.command) {
        tracing::debug!(error = ?err, "iconwear command failed");
        eprintln!("iconwear: {}", err);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands) -> Result<(), ClientError> {
    match command {
        Commands::Launch { resource, agent } => {
            let mut params = json!({ "resource": resource });
            if let Some(agent) = agent {
                params["agent"] = Value::String(agent);
            }
            let data = daemon_client::call(Method::Launch, Some(params))?;
            println!(
                "{} wear level {}",
                field_str(&data, "app_id"),
                field_u64(&data, "wear_level")
            );
        }
        Commands::Level { app_id } => {
            let data = daemon_client::call(Method::GetWearLevel, Some(app_params(app_id)))?;
            println!("{}", field_u64(&data, "wear_level"));
        }
        Commands::Metrics { app_id: Some(app_id) } => {
            let data = daemon_client::call(Method::GetMetrics, Some(app_params(app_id)))?;
            print_json(&data)?;
        }
        Commands::Metrics { app_id: None } => {
            let data = daemon_client::call(Method::ListMetrics, None)?;
            print_json(&data)?;
        }
        Commands::Reset { app_id } => {
            let data = daemon_client::call(Method::ResetWearLevel, Some(app_params(app_id)))?;
            println!(
                "{} reset ({} reconstructions)",
                field_str(&data, "app_id"),
                field_u64(&data, "reconstructions")
            );
        }
        Commands::Reconstructions { app_id } => {
            let data =
                daemon_client::call(Method::GetReconstructions, Some(app_params(app_id)))?;
            println!("{}", field_u64(&data, "reconstructions"));
        }
        Commands::Health => {
            let data = daemon_client::call(Method::GetHealth, None)?;
            print_json(&data)?;
        }
        Commands::Watch => {
            let stdout = std::io::stdout();
            daemon_client::watch(|notification| {
                let mut out = stdout.lock();
                match serde_json::to_string(&notification) {
                    Ok(line) => writeln!(out, "{}", line).and_then(|_| out.flush()).is_ok(),
                    Err(_) => true,
                }
            })?;
        }
    }
    Ok(())
}

fn app_params(app_id: String) -> Value {
    json!({ "app_id": app_id })
}

fn field_str<'a>(data: &'a Value, key: &str) -> &'a str {
    data.get(key).and_then(Value::as_str).unwrap_or("")
}

fn field_u64(data: &Value, key: &str) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn print_json(data: &Value) -> Result<(), ClientError> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}
