use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wearcast::config::PipelineConfig;
use wearcast::events::{EventBus, PipelineEvent};
use wearcast::media::{PcmBlock, RawVideoFrame};
use wearcast::net::SessionState;
use wearcast::pipeline::Coordinator;

/// wearcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "wearcast")]
#[command(version, about = "Live streaming and recording pipeline for wearable cameras", long_about = None)]
struct CliArgs {
    /// Streaming endpoint URL (e.g. rtmp://host/live/key)
    #[arg(short = 'u', long, value_name = "URL")]
    stream_url: Option<String>,

    /// Record to a local MP4 while running
    #[arg(short = 'r', long)]
    record: bool,

    /// Output directory for recordings
    #[arg(short = 'o', long, value_name = "DIR", default_value = "recordings")]
    output_dir: PathBuf,

    /// Capture width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Capture height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Capture frame rate
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Disable audio capture
    #[arg(long)]
    no_audio: bool,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(short = 'd', long, default_value_t = 0)]
    duration: u64,

    /// Log filter (e.g. "info", "wearcast=debug")
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

fn init_logging(filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting wearcast v{}", env!("CARGO_PKG_VERSION"));

    if args.stream_url.is_none() && !args.record {
        anyhow::bail!("nothing to do: pass --stream-url and/or --record");
    }

    let mut config = PipelineConfig::default();
    config.video.width = args.width;
    config.video.height = args.height;
    config.video.fps = args.fps;
    config.audio.enabled = !args.no_audio;
    config.stream.url = args.stream_url.clone();
    config.record.output_dir = args.output_dir.clone();

    // The OS connectivity observer is an external collaborator; the CLI
    // assumes the link stays up.
    let (_conn_tx, conn_rx) = watch::channel(true);
    let events = Arc::new(EventBus::new());
    let coordinator = Coordinator::new(config.clone(), conn_rx, events.clone());

    // Surface session-level status strings
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                PipelineEvent::SessionStatus { status } => tracing::info!("session: {}", status),
                PipelineEvent::RecordingStarted { path } => tracing::info!("recording: {}", path),
                PipelineEvent::RecordingFinished { path } => {
                    tracing::info!("recording finished: {}", path)
                }
                PipelineEvent::PipelineError { module, message } => {
                    tracing::error!("{} error: {}", module, message)
                }
                _ => {}
            }
        }
    });

    if args.stream_url.is_some() {
        coordinator.start_streaming().await?;
        if args.record {
            wait_for_live(&coordinator).await?;
            coordinator.start_recording().await?;
        }
    } else {
        coordinator.start_recording().await?;
    }

    // The camera adapter is external; a synthetic test pattern keeps the
    // binary usable for smoke runs without hardware.
    let source = tokio::spawn(run_test_source(coordinator.clone(), config));

    if args.duration > 0 {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
            _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
        }
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("interrupted");
    }

    source.abort();
    coordinator.shutdown().await;
    Ok(())
}

/// Wait until the network session reports live; a terminal failure aborts
async fn wait_for_live(coordinator: &Arc<Coordinator>) -> anyhow::Result<()> {
    let mut state = coordinator.session().state_watch();
    loop {
        match *state.borrow() {
            SessionState::Live => return Ok(()),
            SessionState::Failed => anyhow::bail!("network session failed before going live"),
            _ => {}
        }
        state.changed().await?;
    }
}

/// Push a moving test pattern and a 440 Hz tone through the pipeline
async fn run_test_source(coordinator: Arc<Coordinator>, config: PipelineConfig) {
    let width = config.video.width as usize;
    let height = config.video.height as usize;
    let fps = config.video.fps.max(1);
    let samples_per_tick = (config.audio.sample_rate / fps) as usize;

    let mut interval = tokio::time::interval(Duration::from_micros(1_000_000 / fps as u64));
    let mut tick: u64 = 0;
    let mut phase: f32 = 0.0;
    let phase_step = 2.0 * std::f32::consts::PI * 440.0 / config.audio.sample_rate as f32;

    loop {
        interval.tick().await;
        let now = Instant::now();

        let mut yuv = vec![0u8; width * height * 3 / 2];
        let shift = (tick * 4) as usize;
        for (row, line) in yuv[..width * height].chunks_exact_mut(width).enumerate() {
            for (col, px) in line.iter_mut().enumerate() {
                *px = (((col + shift) / 8 + row / 8) % 2 * 200 + 30) as u8;
            }
        }
        // neutral chroma
        for px in &mut yuv[width * height..] {
            *px = 128;
        }
        coordinator.on_video_frame(RawVideoFrame::new(
            Bytes::from(yuv),
            width as u32,
            height as u32,
            now,
        ));

        if config.audio.enabled {
            let mut pcm = Vec::with_capacity(samples_per_tick * 2);
            for _ in 0..samples_per_tick {
                let sample = (phase.sin() * 8000.0) as i16;
                pcm.extend_from_slice(&sample.to_le_bytes());
                phase += phase_step;
            }
            coordinator.on_audio_block(PcmBlock::new(Bytes::from(pcm), now));
        }

        tick += 1;
    }
}
