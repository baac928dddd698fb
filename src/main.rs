use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use offshore_climatology::cli::{
    Cli, Commands, OutputFormat, Overrides, generate_template, merge_overrides, render_config,
};
use offshore_climatology::artifact::artifact_path;
use offshore_climatology::climatology::StatisticKind;
use offshore_climatology::exceedance::discover_files;
use offshore_climatology::input::AnalysisConfig;
use offshore_climatology::inspect;
use offshore_climatology::log::{config_echo, show_farewell_with_timing, show_greeting};
use offshore_climatology::pipeline::{self, RunOptions};
use offshore_climatology::storage::{StorageBackend, StorageFactory};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match &cli.command {
        Commands::Preprocess { overrides } => {
            let start_time = Instant::now();
            let config = load_config(&cli.config, overrides, "preprocess")?;
            let summary = pipeline::run_preprocess(&config)
                .await
                .context("preprocessing failed")?;
            print_structured(&summary, cli.output_format)?;
            show_farewell_with_timing(start_time.elapsed());
        }
        Commands::Analyze { overrides, dry_run } => {
            let start_time = Instant::now();
            let config = load_config(&cli.config, overrides, "analysis")?;
            if *dry_run {
                config.validate().context("configuration is invalid")?;
                log::info!("Dry run: configuration is valid, nothing processed");
                return Ok(());
            }
            let options = RunOptions {
                show_progress: !cli.quiet,
            };
            let summary = pipeline::run_analysis(&config, options)
                .await
                .context("analysis failed")?;
            print_structured(&summary, cli.output_format)?;
            show_farewell_with_timing(start_time.elapsed());
        }
        Commands::Validate {
            config_file,
            detailed,
        } => {
            let path = config_file.as_ref().unwrap_or(&cli.config);
            validate(path, *detailed).await?;
        }
        Commands::Inspect {
            file,
            variable,
            format,
        } => {
            let summary = inspect::inspect(file, variable.as_deref()).await?;
            match format.unwrap_or(cli.output_format) {
                OutputFormat::Human => inspect::print_summary_human(&summary),
                OutputFormat::Json => inspect::print_summary_json(&summary)?,
                OutputFormat::Yaml => inspect::print_summary_yaml(&summary)?,
            }
        }
        Commands::Template {
            template_type,
            output,
            format,
        } => {
            let config = generate_template(*template_type);
            let text = render_config(&config, *format)?;
            write_or_print(output.as_deref(), &text)?;
        }
        Commands::Completions { shell, output } => {
            let mut command = Cli::command();
            let name = command.get_name().to_string();
            match output {
                Some(path) => {
                    let mut file = fs::File::create(path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    clap_complete::generate(*shell, &mut command, name, &mut file);
                }
                None => clap_complete::generate(*shell, &mut command, name, &mut io::stdout()),
            }
        }
    }
    Ok(())
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}

/// Reads the configuration file and applies CLI and environment overrides.
fn load_config(path: &Path, cli_overrides: &Overrides, stage: &str) -> Result<AnalysisConfig> {
    show_greeting(stage, &path.display().to_string());
    let mut config = AnalysisConfig::from_file(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    let overrides = merge_overrides(cli_overrides.clone()).map_err(anyhow::Error::msg)?;
    if !overrides.is_empty() {
        log::debug!("applying overrides: {:?}", overrides);
        overrides.apply(&mut config);
    }
    config_echo(&config);
    Ok(config)
}

async fn validate(path: &Path, detailed: bool) -> Result<()> {
    let config = AnalysisConfig::from_file(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("{} is invalid", path.display()))?;
    println!("Configuration {} is valid", path.display());

    if detailed {
        let years = config.years()?;
        let dir = Path::new(&config.opa_path);
        let mut missing = 0;
        for id in config.series()? {
            match discover_files(dir, &id.variable, years.first, years.last) {
                Ok(files) => println!("  {}: {} monthly files found", id, files.len()),
                Err(e) => {
                    println!("  {}: {}", id, e);
                    missing += 1;
                }
            }
        }

        let mut expected = Vec::new();
        if !config.compute_climatologies {
            for name in config.threshold_combination.keys() {
                for kind in StatisticKind::ALL {
                    expected.push(artifact_path(&config.data_path, name, kind, years));
                }
            }
        }
        if config.verify {
            expected.extend(config.verification.iter().map(|e| e.reference.clone()));
        }
        for location in &expected {
            let storage = StorageFactory::from_path(location).await?;
            if storage.exists(location).await? {
                println!("  {}: found", location);
            } else {
                println!("  {}: not found", location);
                missing += 1;
            }
        }

        if missing > 0 {
            anyhow::bail!("{} inputs are missing", missing);
        }
    }
    Ok(())
}

fn print_structured<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Human => {}
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn write_or_print(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
            log::info!("Wrote {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}
