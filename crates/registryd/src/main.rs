//! The registry daemon.
//!
//! Serves the coordination tree on one TCP endpoint and exits once an EXIT
//! request arrives and every client has disconnected.

use clap::Parser;
use lattice_registry::RegistryServer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Registry daemon command line arguments.
#[derive(Parser, Debug)]
#[command(name = "latticed")]
#[command(about = "Lattice coordination registry daemon")]
struct Args {
	/// Endpoint to serve on, `ip` or `ip:port`. With no port a random free
	/// port is chosen and logged.
	#[arg(long, value_name = "ADDR", default_value = "127.0.0.1")]
	endpoint: String,

	/// Verbose logging.
	#[arg(short, long)]
	verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let default_level = if args.verbose { "debug" } else { "info" };
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
		)
		.init();

	let server = RegistryServer::bind(&args.endpoint).await?;
	info!(endpoint = %server.endpoint(), "registry daemon up");
	server.wait().await;
	Ok(())
}
