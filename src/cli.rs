use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::cross_training::cross_training;
use crate::hindcast::{cross_hindcast, forecast};
use crate::pipeline::CsvPipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub command: String,
    pub config_path: PathBuf,
    pub out: Option<PathBuf>,
}

/// `<command> [--config <path>] [--out <path>]`
pub fn parse_args(args: &[String]) -> Result<CliArgs> {
    let mut command = None;
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut out = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("`{}` requires a path argument", arg))?;
                config_path = PathBuf::from(value);
            }
            "--out" | "-o" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow!("`{}` requires a path argument", arg))?;
                out = Some(PathBuf::from(value));
            }
            flag if flag.starts_with('-') && !matches!(flag, "-h" | "--help") => {
                bail!("unknown option `{}`", flag)
            }
            other => {
                if command.is_some() {
                    bail!("unexpected argument `{}`", other);
                }
                command = Some(other.to_string());
            }
        }
    }
    Ok(CliArgs {
        command: command.unwrap_or_else(|| "help".to_string()),
        config_path,
        out,
    })
}

pub fn needs_config(command: &str) -> bool {
    matches!(command, "train" | "hindcast" | "forecast")
}

pub fn run_cli(args: &CliArgs, config: Option<&Config>) -> Result<()> {
    match args.command.as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        cmd if needs_config(cmd) => {
            let config = config.ok_or_else(|| anyhow!("`{}` requires a config", cmd))?;
            match cmd {
                "train" => run_train(config),
                "hindcast" => run_hindcast(config, args.out.as_deref()),
                _ => run_forecast(config),
            }
        }
        other => bail!(
            "unknown subcommand `{}`. expected one of: train|hindcast|forecast|help",
            other
        ),
    }
}

fn print_usage() {
    println!("enso-dem <command> [--config <path>] [--out <path>]");
    println!();
    println!("commands:");
    println!("  train     leave-one-decade-out training for every lead time (resumable)");
    println!("  hindcast  predict each held-out decade and write the hindcast table");
    println!("  forecast  combine all decade ensembles and forecast from the latest row");
    println!("  help      show this message");
    println!();
    println!("default config: {}", DEFAULT_CONFIG_PATH);
}

fn make_rng(seed: Option<u64>) -> Box<dyn RngCore> {
    match seed {
        Some(seed) => Box::new(StdRng::seed_from_u64(seed)),
        None => Box::new(rand::rng()),
    }
}

fn load_pipeline(config: &Config) -> Result<CsvPipeline> {
    CsvPipeline::from_path(
        &config.data.features_csv,
        &config.data.columns(),
        config.data.lags(),
    )
}

fn run_train(config: &Config) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let decades = config.training.decades()?;
    let prototype = config.build_model()?;
    let mut rng = make_rng(config.training.seed);

    let report = cross_training(
        || prototype.clone(),
        &pipeline,
        config.training.n_iter,
        &config.training.lead_times,
        &decades,
        &config.training.model_dir,
        rng.as_mut(),
    )?;
    tracing::info!(
        trained = report.trained.len(),
        skipped = report.skipped.len(),
        model_dir = %config.training.model_dir.display(),
        "cross training finished"
    );
    println!(
        "trained {} cells, skipped {} existing cells",
        report.trained.len(),
        report.skipped.len()
    );
    Ok(())
}

fn run_hindcast(config: &Config, out: Option<&Path>) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let decades = config.training.decades()?;
    let hindcast = cross_hindcast(
        &pipeline,
        config.model.name.trim(),
        &config.training.lead_times,
        &decades,
        &config.training.model_dir,
    )?;
    let path = out.unwrap_or(&config.training.hindcast_csv);
    hindcast
        .write_csv(path)
        .with_context(|| format!("failed to write hindcast to {}", path.display()))?;

    println!("lead  rmse     corr     nll      persist_rmse");
    for skill in hindcast.skill()? {
        let fmt_opt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v));
        println!(
            "{:>4}  {:<7.4}  {:<7.4}  {:<7}  {}",
            skill.lead_time,
            skill.rmse,
            skill.correlation,
            fmt_opt(skill.nll),
            fmt_opt(skill.persistence_rmse)
        );
    }
    tracing::info!(path = %path.display(), "hindcast written");
    Ok(())
}

fn run_forecast(config: &Config) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let decades = config.training.decades()?;
    let latest = pipeline.latest_features()?;
    let issued = pipeline
        .last_date()
        .ok_or_else(|| anyhow!("feature table is empty"))?;
    let forecasts = forecast(
        config.model.name.trim(),
        &config.training.lead_times,
        &decades,
        &config.training.model_dir,
        latest.view(),
    )?;

    println!("issued from observations up to {}", issued);
    println!("lead  mean     std");
    for f in &forecasts {
        let std = f.std.map_or_else(|| "-".to_string(), |s| format!("{:.4}", s));
        println!("{:>4}  {:<7.4}  {}", f.lead_time, f.mean, std);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_command_and_options() {
        let parsed = parse_args(&args(&["hindcast", "--config", "x.toml", "-o", "out.csv"])).unwrap();
        assert_eq!(parsed.command, "hindcast");
        assert_eq!(parsed.config_path, PathBuf::from("x.toml"));
        assert_eq!(parsed.out, Some(PathBuf::from("out.csv")));
    }

    #[test]
    fn defaults_to_help() {
        let parsed = parse_args(&[]).unwrap();
        assert_eq!(parsed.command, "help");
        assert!(!needs_config(&parsed.command));
        assert!(run_cli(&parsed, None).is_ok());
    }

    #[test]
    fn rejects_unknown_input() {
        assert!(parse_args(&args(&["train", "--seed"])).is_err());
        assert!(parse_args(&args(&["train", "extra"])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
        let parsed = parse_args(&args(&["deploy"])).unwrap();
        assert!(run_cli(&parsed, None).is_err());
    }
}
