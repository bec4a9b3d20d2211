use std::{cell::Cell, path::PathBuf, rc::Rc, time::Duration};

use audio_reactor_core::{AppConfig, AudioEngine, Result};
use clap::{Parser, Subcommand};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Play { input, run } => run_play(&config, input, run).await,
        Commands::Mic { run } => run_mic(&config, run).await,
        Commands::Config => {
            println!("{}", config.to_json_string()?);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };
    if let Some(sensitivity) = cli.sensitivity {
        config.controls.sensitivity = sensitivity;
    }
    if let Some(threshold) = cli.beat_threshold {
        config.controls.beat_threshold = threshold;
    }
    Ok(config)
}

async fn run_play(config: &AppConfig, input: PathBuf, run: RunArgs) -> Result<()> {
    let mut engine = with_speakers(AudioEngine::with_config(config), config);
    engine.load_path(&input).await?;
    info!(
        track = engine.track_name().unwrap_or_default(),
        duration = engine.duration(),
        "starting playback"
    );

    let finished = Rc::new(Cell::new(false));
    install_callbacks(&mut engine, finished.clone());
    engine.play();

    drive(&mut engine, config, &run, &finished).await;
    engine.dispose();
    Ok(())
}

async fn run_mic(config: &AppConfig, run: RunArgs) -> Result<()> {
    let mut engine = AudioEngine::with_config(config);
    let finished = Rc::new(Cell::new(false));
    install_callbacks(&mut engine, finished.clone());
    engine.start_mic().await?;

    drive(&mut engine, config, &run, &finished).await;
    engine.dispose();
    Ok(())
}

#[cfg(feature = "cpal")]
fn with_speakers(engine: AudioEngine, config: &AppConfig) -> AudioEngine {
    match audio_reactor_core::CpalOutput::open(config.audio.output_capacity) {
        Ok(output) => engine.with_sink(output),
        Err(err) => {
            tracing::warn!(%err, "no audio output, analysing silently");
            engine
        }
    }
}

#[cfg(not(feature = "cpal"))]
fn with_speakers(engine: AudioEngine, _config: &AppConfig) -> AudioEngine {
    info!("built without the `cpal` feature, playback is silent");
    engine
}

fn install_callbacks(engine: &mut AudioEngine, finished: Rc<Cell<bool>>) {
    engine.on_beat(|| debug!("beat"));
    engine.on_bpm_update(|bpm| info!(bpm, "tempo updated"));
    engine.on_ended(move || {
        info!("track finished");
        finished.set(true);
    });
}

/// Host frame loop: one `update` per tick, a level report once a second.
async fn drive(
    engine: &mut AudioEngine,
    config: &AppConfig,
    run: &RunArgs,
    finished: &Cell<bool>,
) {
    let fps = run.fps.unwrap_or(config.audio.frame_rate).max(1);
    let mut ticker = interval(Duration::from_secs_f64(1.0 / f64::from(fps)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let limit = run
        .seconds
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0)
        .map(Duration::from_secs_f64);
    let started = Instant::now();
    let mut frame: u64 = 0;

    while !finished.get() {
        ticker.tick().await;
        engine.update();
        frame += 1;

        if frame % u64::from(fps) == 0 {
            let values = engine.values();
            info!(
                bass = values.bass,
                mid = values.mid,
                high = values.high,
                overall = values.overall,
                bpm = ?engine.bpm(),
                time = engine.current_time(),
                "levels"
            );
        }
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Audio-reactive band energy and beat analyser",
    long_about = None
)]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Shared sensitivity multiplier for every band.
    #[arg(long, global = true)]
    sensitivity: Option<f32>,
    /// Absolute raw bass level a beat must exceed.
    #[arg(long, global = true)]
    beat_threshold: Option<f32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Frames per second of the update loop. Defaults to the configured rate.
    #[arg(long)]
    fps: Option<u32>,
    /// Stop after this many seconds.
    #[arg(long)]
    seconds: Option<f64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play an audio file and analyse it in real time.
    Play {
        /// Path to a wav, flac, ogg, mp3 or m4a file.
        input: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Analyse the default capture device (requires the `cpal` feature).
    Mic {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Print the effective configuration as JSON.
    Config,
}
