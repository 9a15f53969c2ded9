use clap::{command, Parser};
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
	/// Number of block signers serving the chain
	#[arg(long)]
	pub signers: Option<usize>,
	/// Number of peers serving blocks with forged witnesses
	#[arg(long)]
	pub byzantine_peers: Option<usize>,
	/// Number of blocks after which the simulation stops
	#[arg(short, long)]
	pub blocks: Option<usize>,
	/// Maximum number of concurrent fast sync jobs
	#[arg(short, long)]
	pub parallelism: Option<usize>,
}
