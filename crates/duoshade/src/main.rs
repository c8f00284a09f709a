mod app;
mod cli;
mod controls;
mod input;
mod loader;
mod paths;
mod run;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use cli::{Command, ConfigAction};
use paths::AppPaths;
use stageconfig::TEMPLATE;

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    match cli.command {
        Some(Command::Check(args)) => run::check(args),
        Some(Command::Crop(args)) => run::crop(args),
        Some(Command::Config(config_cmd)) => handle_config_command(config_cmd.action, cli.run.config),
        None => run::run(cli.run),
    }
}

fn handle_config_command(action: ConfigAction, explicit: Option<PathBuf>) -> Result<()> {
    let paths = AppPaths::discover()?;
    let path = explicit.unwrap_or_else(|| paths.config_file());

    match action {
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite it",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            fs::write(&path, TEMPLATE)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote starter configuration to {}", path.display());
        }
        ConfigAction::Where => {
            println!("Configuration directories:");
            println!("  config:   {}", paths.config_dir().display());
            println!("  data:     {}", paths.data_dir().display());
            println!("  stage:    {}", path.display());
            println!("  captures: {}", paths.capture_dir().display());
            println!("Texture search roots:");
            for root in paths.texture_roots(None) {
                println!("  {}", root.display());
            }
        }
        ConfigAction::Check { print } => {
            let config = run::load_config(&path)?;
            config
                .validate()
                .with_context(|| format!("{} failed validation", path.display()))?;
            if print {
                let rendered = toml::to_string_pretty(&config)
                    .context("failed to render configuration")?;
                print!("{rendered}");
                return Ok(());
            }
            println!(
                "{} is valid ({} global presets, {}x{} tiles, {} mixer channels)",
                path.display(),
                config.presets.len(),
                config.tiles.rows,
                config.tiles.cols,
                config.mixer.channels
            );
        }
    }
    Ok(())
}
