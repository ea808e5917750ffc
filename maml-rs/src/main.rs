//! CLI entry point for maml-rs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maml_rs::{run, MamlConfig, Result, RunOptions, DEFAULT_LOG_INTERVAL};

#[derive(Parser)]
#[command(name = "maml")]
#[command(about = "Model-agnostic meta-learning for few-shot regression")]
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
        config: PathBuf,
    },
    /// Start meta-training
    Train {
        /// Path to configuration file
        config: PathBuf,
        /// Iterations between evaluations
        #[arg(long, default_value_t = DEFAULT_LOG_INTERVAL)]
        log_interval: usize,
        /// Train even if a result for this configuration exists
        #[arg(long)]
        rerun: bool,
        /// Directory holding run results
        #[arg(long, default_value = "results")]
        results_dir: PathBuf,
    },
    /// Generate a configuration file with task defaults
    Init {
        /// Output path for config file
        #[arg(default_value = "config.toml")]
        output: PathBuf,
        /// Task family (sine, linear)
        #[arg(long, default_value = "sine")]
        task: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = MamlConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Task: {}", config.task);
            println!("  Iterations: {}", config.n_iter);
            println!("  Hidden layers: {:?}", config.n_hidden);
            let unexpected = config.unexpected_keys();
            if !unexpected.is_empty() {
                println!("  Unexpected keys: {}", unexpected.join(", "));
            }
        }
        Commands::Train {
            config,
            log_interval,
            rerun,
            results_dir,
        } => {
            tracing::info!("Starting training with config: {}", config.display());
            let config = MamlConfig::from_file(&config)?;
            let options = RunOptions::default()
                .with_log_interval(log_interval)
                .with_rerun(rerun)
                .with_results_dir(results_dir);

            let logger = run(&config, &options)?;
            match logger.num_checkpoints().checked_sub(1) {
                Some(last) => println!(
                    "✓ Finished: valid loss {:.4} +/- {:.4}, test loss {:.4} +/- {:.4} (iteration {})",
                    logger.valid_loss[last],
                    logger.valid_conf[last],
                    logger.test_loss[last],
                    logger.test_conf[last],
                    logger.checkpoint_iters[last],
                ),
                None => println!("✓ Finished: no checkpoints recorded"),
            }
        }
        Commands::Init { output, task } => {
            tracing::info!("Generating config for task: {}", task);
            let config = MamlConfig::default_for(&task)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}
