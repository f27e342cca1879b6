//! imserver Control CLI
//!
//! Command-line interface for the imserver daemon's management API.

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

#[derive(Parser, Debug)]
#[command(name = "imserverctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8081")]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// View online statistics
    Stats,
    /// List connected user ids
    Users,
    /// Push a message to a connected user
    Push {
        /// Recipient user id
        to_user_id: String,
        /// Message text, sent verbatim
        message: String,
    },
    /// Disconnect a user
    Kick {
        /// User id
        user_id: String,
    },
}

#[derive(Debug, Serialize)]
struct PushRequest {
    to_user_id: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    status: String,
    detail: Option<String>,
}

#[derive(Debug, Deserialize, Tabled)]
struct SystemStats {
    online_count: usize,
    connections: usize,
}

#[derive(Tabled)]
struct UserRow {
    user_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = Client::new();

    match args.command {
        Commands::Stats => {
            let resp = client
                .get(format!("{}/admin/stats", args.api))
                .send()
                .await?
                .error_for_status()?;

            let stats: SystemStats = resp.json().await?;
            let table = tabled::Table::new(vec![stats]).to_string();
            println!("{}", table);
        }
        Commands::Users => {
            let resp = client
                .get(format!("{}/admin/users", args.api))
                .send()
                .await?
                .error_for_status()?;

            let users: Vec<String> = resp.json().await?;
            if users.is_empty() {
                println!("No users online");
            } else {
                let rows: Vec<UserRow> = users.into_iter().map(|user_id| UserRow { user_id }).collect();
                println!("{}", tabled::Table::new(rows));
            }
        }
        Commands::Push {
            to_user_id,
            message,
        } => {
            let req = PushRequest {
                to_user_id,
                message,
            };
            let resp = client
                .post(format!("{}/admin/push", args.api))
                .json(&req)
                .send()
                .await?;

            let code = resp.status();
            let body: PushResponse = resp.json().await?;
            if code.is_success() {
                println!("Push {}", body.status);
            } else {
                bail!(
                    "Push {} ({}): {}",
                    body.status,
                    code,
                    body.detail.unwrap_or_default()
                );
            }
        }
        Commands::Kick { user_id } => {
            let encoded = utf8_percent_encode(&user_id, NON_ALPHANUMERIC);
            let resp = client
                .delete(format!("{}/admin/users/{}", args.api, encoded))
                .send()
                .await?;

            match resp.status() {
                StatusCode::NOT_FOUND => bail!("User {} is not online", user_id),
                status if status.is_success() => println!("User {} disconnected", user_id),
                status => bail!("Error: {}", status),
            }
        }
    }

    Ok(())
}
