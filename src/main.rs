//! CLI entry point for visiontrain-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use visiontrain_rs::{Result, Trainer, VisionConfig};

#[derive(Parser)]
#[command(name = "visiontrain")]
#[command(about = "YAML-driven training orchestrator for image classification")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from a checkpoint file
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (shufflenet, mobilenet-multilabel, linear-scratch)
        #[arg(long, default_value = "shufflenet")]
        preset: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("validating configuration: {}", config);
            let config = VisionConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  model: {}", config.model.choice);
            println!("  classes: {}", config.model.num_classes);
            println!("  data root: {}", config.data.root.display());
        }
        Commands::Train { config, resume } => {
            tracing::info!("starting training with config: {}", config);
            let config = VisionConfig::from_file(&config)?;
            let mut trainer = Trainer::new(config)?;
            trainer.run(resume.as_deref())?;
        }
        Commands::Init { output, preset } => {
            tracing::info!("generating config for preset: {}", preset);
            let config = VisionConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
