use anyhow::Result;

use enso_dem::cli::{needs_config, parse_args, run_cli};
use enso_dem::config::Config;

fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&raw)?;

    let config = if needs_config(&args.command) {
        match Config::load_from_path(&args.config_path) {
            Ok(c) => Some(c),
            Err(e) => {
                eprintln!("Failed to load config: {:#}", e);
                eprintln!(
                    "Pass --config <path> or create {}",
                    enso_dem::config::DEFAULT_CONFIG_PATH
                );
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    if let Some(config) = &config {
        let filter =
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.logging.level.as_str())
            });
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);
        if config.logging.json {
            builder.json().init();
        } else {
            builder.init();
        }
        tracing::info!(
            model = %config.model.name,
            model_dir = %config.training.model_dir.display(),
            command = %args.command,
            "Starting enso-dem"
        );
    }

    run_cli(&args, config.as_ref())
}
