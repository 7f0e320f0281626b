use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use oceanproxy::{app, parse_config, telemetry};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();

	let contents = match &args.file {
		Some(path) => fs_err::read_to_string(path)?,
		None => String::new(),
	};
	let config = Arc::new(parse_config(contents)?);

	let bound = app::run(config).await?;
	bound.wait_termination().await
}
