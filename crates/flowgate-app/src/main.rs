use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "flowgate", version, about = "Rule-routed multi-protocol proxy engine")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long, default_value = "config.yaml")]
	config: PathBuf,

	/// Overrides the configured log level.
	#[arg(long)]
	log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let mut config = flowgate::config::load(&args.config)?;
	if args.log_level.is_some() {
		config.log_level = args.log_level;
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(flowgate::app::run(config))
}
