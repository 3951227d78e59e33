//! CLI for popq
//!
//! Subcommands:
//! - `server`: run the broker behind the WebSocket transport
//! - `publish`: send one message to a queue or an exchange
//! - `consume`: print messages from a queue until Ctrl-C
//! - `declare-exchange`, `bind`: set up routing

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use popq::broker::{AckMode, Broker, ExchangeKind};
use popq::client::Channel;
use popq::config::{Settings, load_config_from};
use popq::transport::start_websocket_server;
use popq::utils::{BrokerError, Result, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "popq", version, about = "A work queue broker with acknowledgments")]
struct Cli {
    /// Server URL (default: ws://{server.host}:{server.port} from the configuration)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Configuration file, replacing config/default
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the broker server
    Server,
    /// Publish a message
    Publish {
        /// Queue name, or exchange name with --exchange
        target: String,
        /// Message words, joined by spaces
        message: Vec<String>,
        /// Declare the queue durable and mark the message persistent
        #[arg(long)]
        durable: bool,
        /// Treat the target as an exchange
        #[arg(long)]
        exchange: bool,
        /// Declare the exchange with this type before publishing
        #[arg(long = "type", requires = "exchange")]
        kind: Option<ExchangeKind>,
        #[arg(long, default_value = "", requires = "exchange")]
        routing_key: String,
    },
    /// Consume messages from a queue until interrupted
    Consume {
        /// Queue name; an empty name declares a server-named queue
        queue: String,
        #[arg(long, default_value_t = AckMode::Manual)]
        ack_mode: AckMode,
        /// Maximum unacknowledged deliveries (0 = unlimited)
        #[arg(long)]
        prefetch: Option<u16>,
        #[arg(long)]
        durable: bool,
        /// Bind the queue to this exchange first
        #[arg(long)]
        exchange: Option<String>,
        /// Declare the exchange with this type before binding
        #[arg(long = "type", requires = "exchange")]
        kind: Option<ExchangeKind>,
        #[arg(long, default_value = "", requires = "exchange")]
        routing_key: String,
    },
    /// Declare an exchange
    DeclareExchange {
        name: String,
        #[arg(long = "type")]
        kind: ExchangeKind,
    },
    /// Bind a queue to an exchange
    Bind {
        exchange: String,
        queue: String,
        #[arg(long, default_value = "")]
        routing_key: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = load_config_from(cli.config.as_deref());
    let level = cli
        .log_level
        .clone()
        .or_else(|| settings.as_ref().ok().map(|s| s.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    logging::init(&level);

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let url = cli.url.unwrap_or_else(|| settings.server.url());

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Publish {
            target,
            message,
            durable,
            exchange,
            kind,
            routing_key,
        } => {
            let message = if message.is_empty() {
                "Hello World!".to_string()
            } else {
                message.join(" ")
            };
            let route = if exchange {
                Route::Exchange {
                    name: target,
                    kind,
                    routing_key,
                }
            } else {
                Route::Queue(target)
            };
            run_publish(&url, route, &message, durable).await
        }
        Command::Consume {
            queue,
            ack_mode,
            prefetch,
            durable,
            exchange,
            kind,
            routing_key,
        } => {
            let binding = exchange.map(|name| (name, kind, routing_key));
            run_consume(&url, &queue, ack_mode, prefetch, durable, binding).await
        }
        Command::DeclareExchange { name, kind } => match Channel::connect(&url).await {
            Ok(channel) => channel.declare_exchange(&name, kind).await.map(|()| {
                println!(" [x] Declared {kind} exchange '{name}'");
            }),
            Err(e) => Err(e),
        },
        Command::Bind {
            exchange,
            queue,
            routing_key,
        } => match Channel::connect(&url).await {
            Ok(channel) => channel.bind(&exchange, &queue, &routing_key).await.map(|()| {
                println!(" [x] Bound '{queue}' to '{exchange}' with key '{routing_key}'");
            }),
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<()> {
    let addr = settings.server.addr();
    let broker = Broker::open(settings.broker)?;

    tokio::select! {
        res = start_websocket_server(&addr, broker) => {
            res?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

enum Route {
    Queue(String),
    Exchange {
        name: String,
        kind: Option<ExchangeKind>,
        routing_key: String,
    },
}

async fn run_publish(url: &str, route: Route, message: &str, durable: bool) -> Result<()> {
    let channel = Channel::connect(url).await?;

    match route {
        Route::Queue(queue) => {
            let queue = channel.declare_queue(&queue, durable).await?;
            channel.publish("", &queue, message, durable)?;
        }
        Route::Exchange {
            name,
            kind,
            routing_key,
        } => {
            if let Some(kind) = kind {
                channel.declare_exchange(&name, kind).await?;
            }
            channel.publish(&name, &routing_key, message, durable)?;
        }
    }
    println!(" [x] Sent {message:?}");

    channel.close().await;
    Ok(())
}

async fn run_consume(
    url: &str,
    queue: &str,
    ack_mode: AckMode,
    prefetch: Option<u16>,
    durable: bool,
    binding: Option<(String, Option<ExchangeKind>, String)>,
) -> Result<()> {
    let channel = Channel::connect(url).await?;
    let queue = channel.declare_queue(queue, durable).await?;

    if let Some((exchange, kind, routing_key)) = binding {
        if let Some(kind) = kind {
            channel.declare_exchange(&exchange, kind).await?;
        }
        channel.bind(&exchange, &queue, &routing_key).await?;
    }

    let mut consumer = channel.consume(&queue, ack_mode, prefetch).await?;
    println!(" [*] Waiting for messages in '{queue}'. To exit press CTRL+C");

    loop {
        tokio::select! {
            next = consumer.next() => {
                let Some(delivery) = next else {
                    return Err(BrokerError::ConnectionClosed);
                };
                println!(" [x] Received {:?}", delivery.payload_str());
                if ack_mode == AckMode::Manual {
                    channel.ack(delivery.delivery_tag)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received. Exiting gracefully.");
                break;
            }
        }
    }

    channel.close().await;
    Ok(())
}
