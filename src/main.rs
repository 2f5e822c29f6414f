//! Demo recorder: drives a synthetic capture through a full recording and
//! prints the merged clip location.

use anyhow::{bail, Context};
use clap::Parser;
use clip_recorder::capture::synthetic::GeneratorConfig;
use clip_recorder::capture::SyntheticCaptureSource;
use clip_recorder::config::RecorderConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "clip-recorder", version, about = "Record a synthetic capture into a merged clip")]
struct Args {
    /// Path to the recorder config (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seconds of media to record
    #[arg(long, default_value_t = 3.0)]
    seconds: f64,

    /// Record without the secondary (microphone) audio channel
    #[arg(long)]
    no_mic: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("clip-recorder")
        .join("config.json")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clip_recorder::init_tracing();
    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);

    if args.write_default_config {
        RecorderConfig::default()
            .save(&config_path)
            .with_context(|| format!("failed to write config to {}", config_path.display()))?;
        println!("{}", config_path.display());
        return Ok(());
    }

    if !args.seconds.is_finite() || args.seconds <= 0.0 {
        bail!("--seconds must be a positive number");
    }

    let config = RecorderConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    tracing::info!("Starting Clip Recorder v{}", env!("CARGO_PKG_VERSION"));

    let source = Arc::new(SyntheticCaptureSource::new());
    let recorder = clip_recorder::build_recorder(&config, source.clone());

    recorder
        .start_record(!args.no_mic)
        .context("failed to start recording")?;
    source.spawn_generator(GeneratorConfig::default(), Duration::from_secs_f64(args.seconds));

    tokio::select! {
        _ = source.join_generator() => {}
        _ = tokio::signal::ctrl_c() => {
            recorder.discard();
            bail!("interrupted; recording discarded");
        }
    }

    let clip = recorder.stop_record().await.context("recording failed")?;
    println!("{}", clip.display());
    Ok(())
}
