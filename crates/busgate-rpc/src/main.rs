//! Busgate RPC - JSON-RPC 2.0 gateway front end.
//!
//! `serve` accepts connections and runs one JSON-RPC session per connection;
//! `call` connects to a running server, issues a single request and prints
//! the result.

mod client;
mod handler;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "busgate-rpc")]
#[command(about = "JSON-RPC gateway over length-prefixed TCP")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve JSON-RPC sessions on accepted connections
    Serve {
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long, default_value = "0")]
        port: String,

        /// Listen backlog, and the connection cap with --enforce-limit
        #[arg(long, default_value_t = 16)]
        backlog: u32,

        /// Bind to all interfaces instead of loopback
        #[arg(long)]
        allow_non_local: bool,

        /// Refuse connections beyond the backlog size
        #[arg(long)]
        enforce_limit: bool,
    },

    /// Send one request to a running server and print the result
    Call {
        /// Server host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Server port or service name
        #[arg(short, long)]
        port: String,

        /// Method to call
        method: String,

        /// Params as a JSON value
        params: Option<String>,

        /// Send as a notification and do not wait for a response
        #[arg(long)]
        notify: bool,

        /// Connection attempts after the first one fails
        #[arg(long, default_value_t = 0)]
        retries: u32,

        /// Delay before the first retry, doubled on each further retry
        #[arg(long, default_value_t = 200)]
        retry_delay_ms: u64,

        /// Give up when no response has arrived after this long
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

fn init_logging(debug: bool) {
    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact();

    // RUST_LOG wins over --debug when set
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => {
            let log_level = if debug { Level::DEBUG } else { Level::INFO };
            builder.with_max_level(log_level).init()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    match args.command {
        Command::Serve {
            port,
            backlog,
            allow_non_local,
            enforce_limit,
        } => server::run(server::ServeOptions {
            port,
            backlog,
            allow_non_local,
            enforce_limit,
        }),
        Command::Call {
            host,
            port,
            method,
            params,
            notify,
            retries,
            retry_delay_ms,
            timeout_ms,
        } => {
            let params = params
                .map(|p| serde_json::from_str(&p))
                .transpose()
                .map_err(|e| anyhow::anyhow!("Invalid params JSON: {}", e))?;
            let result = client::run(client::CallOptions {
                host,
                port,
                method,
                params,
                notify,
                retries,
                retry_delay: Duration::from_millis(retry_delay_ms),
                timeout: Duration::from_millis(timeout_ms),
            })?;
            // Result JSON on stdout for scripting
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}
