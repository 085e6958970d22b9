// Run a voice conversation from a WAV file, recording the agent to another WAV file
//
// Usage: duplex-voice --input question.wav --output reply.wav --duration 30

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use duplex_voice::{Config, EngineEvent, VoiceEngine, WavDevices};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "duplex-voice")]
#[command(about = "Talk to a realtime voice agent")]
struct Args {
    /// Config file (without extension)
    #[arg(short, long, default_value = "config/duplex-voice")]
    config: String,

    /// WAV file to use as the microphone
    #[arg(short, long)]
    input: PathBuf,

    /// WAV file to write agent audio to
    #[arg(short, long, default_value = "agent.wav")]
    output: PathBuf,

    /// Stop after this many seconds (default: until Ctrl+C)
    #[arg(short, long)]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    info!("Duplex Voice v{}", env!("CARGO_PKG_VERSION"));
    info!("Input: {}", args.input.display());
    info!("Output: {}", args.output.display());

    let devices = Arc::new(WavDevices {
        input: args.input.clone(),
        output: args.output.clone(),
    });
    let mut engine = VoiceEngine::new(config, devices);
    let mut events = engine.take_events();

    engine.connect().await?;
    info!("Connected; press Ctrl+C to stop");

    let limit = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(limit);

    loop {
        let event = async {
            match events.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = &mut limit => {
                info!("Duration reached, shutting down");
                break;
            }
            event = event => match event {
                Some(EngineEvent::Transcript(segment)) => {
                    info!("[{:?}] {}", segment.speaker, segment.text);
                }
                Some(EngineEvent::Error { kind, message }) => {
                    warn!("{}: {}", kind, message);
                }
                Some(EngineEvent::Disconnected) | None => break,
                Some(_) => {}
            },
        }
    }

    let stats = engine.stats();
    engine.disconnect().await;

    info!(
        "Done: {} frames sent, {} chunks played, {} interruptions",
        stats.frames_sent, stats.chunks_played, stats.interruptions
    );
    Ok(())
}
