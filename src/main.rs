use std::{collections::HashMap, time::Duration};

use clap::{Args, Parser, Subcommand};
use eyre::eyre;
use tablemq::{message::Headers, MessageId, QueueConnection};

#[derive(Parser)]
#[command(name = "tablemq")]
#[command(about = "Inspect and operate a SQL table message queue")]
#[command(version)]
struct Cli {
    /// Database URL with optional transport options in the query string
    #[arg(long, env = "TABLEMQ_DSN")]
    dsn: String,

    /// Transport option as key=value, may be repeated
    #[arg(short, long = "option", value_parser = parse_key_value)]
    options: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the queue table if it does not exist
    Setup,
    /// Print the number of messages waiting for delivery
    Count,
    /// List messages waiting for delivery, oldest first
    List {
        #[arg(short, long)]
        limit: Option<u32>,
    },
    /// Print a single message
    Show { id: MessageId },
    /// Queue a message
    Send(SendArgs),
    /// Delete a message after processing
    Ack { id: MessageId },
    /// Delete a message that must not be retried
    Reject { id: MessageId },
}

#[derive(Args)]
struct SendArgs {
    /// Message body, stored as is
    body: String,

    /// Header as key=value, may be repeated
    #[arg(short = 'H', long = "header", value_parser = parse_key_value)]
    headers: Vec<(String, String)>,

    /// Milliseconds before the message becomes available
    #[arg(short, long, default_value_t = 0)]
    delay_ms: u64,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got \"{s}\""))?;

    if key.is_empty() {
        return Err(format!("empty key in \"{s}\""));
    }

    Ok((key.to_owned(), value.to_owned()))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tablemq::init_tracing()?;

    let cli = Cli::parse();
    let options: HashMap<String, String> = cli.options.into_iter().collect();

    let connection = tablemq::open_connection(&cli.dsn, &options).await?;

    match cli.command {
        Commands::Setup => {
            connection.setup().await?;
            println!("queue table {} is ready", connection.configuration().table_name);
        }
        Commands::Count => {
            println!("{}", connection.message_count().await?);
        }
        Commands::List { limit } => {
            let messages = connection.find_all(limit).await?;
            println!("{}", serde_json::to_string_pretty(&messages)?);
        }
        Commands::Show { id } => {
            let message = connection
                .find(id)
                .await?
                .ok_or_else(|| eyre!("message {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&message)?);
        }
        Commands::Send(args) => {
            let headers: Headers = args.headers.into_iter().collect();
            let id = connection
                .send(&args.body, &headers, Duration::from_millis(args.delay_ms))
                .await?;
            println!("{id}");
        }
        Commands::Ack { id } => {
            if !connection.ack(id).await? {
                return Err(eyre!("message {id} not found"));
            }
        }
        Commands::Reject { id } => {
            if !connection.reject(id).await? {
                return Err(eyre!("message {id} not found"));
            }
        }
    }

    Ok(())
}
