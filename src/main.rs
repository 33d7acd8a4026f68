use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use codec_bus::{
    AvPlayer, AvPlayerConfig, ClipConfig, ClipEvent, ClipTask, FfmpegBackend, PlayerEvent,
    demuxer::find_track, session::CodecBackend,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::runtime::Handle;

#[derive(Parser, Debug)]
#[command(name = "hardclip", version, about = "Hardware accelerated clip and playback")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a source in real time and report its progress
    Play(PlayArgs),
    /// Crop, re-encode and mux a source into a new file
    Clip(ClipArgs),
    /// Print the tracks of a source
    Probe {
        input: String,
    },
}

#[derive(Args, Debug)]
struct PlayArgs {
    input: Option<String>,
    /// JSON player configuration; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    no_video: bool,
    #[arg(long)]
    no_audio: bool,
    #[arg(long = "loop")]
    looping: bool,
}

#[derive(Args, Debug)]
struct ClipArgs {
    input: Option<String>,
    output: Option<String>,
    /// JSON clip configuration; flags take precedence
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Crop window as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_size)]
    crop: Option<(u32, u32)>,
    #[arg(long)]
    left: Option<u32>,
    #[arg(long)]
    top: Option<u32>,
    #[arg(long)]
    clarity: Option<f32>,
    #[arg(long)]
    no_audio: bool,
}

fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
    let w = w.parse().map_err(|e| format!("width: {e}"))?;
    let h = h.parse().map_err(|e| format!("height: {e}"))?;
    Ok((w, h))
}

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("codec_bus", log::LevelFilter::Info)
        .filter_module("hardclip", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn load_config<T: DeserializeOwned + Default>(path: Option<&Path>) -> anyhow::Result<T> {
    match path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| anyhow::anyhow!("open {}: {}", path.display(), e))?;
            Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
        }
        None => Ok(T::default()),
    }
}

async fn play(args: PlayArgs, backend: Arc<dyn CodecBackend>) -> anyhow::Result<()> {
    let mut config: AvPlayerConfig = load_config(args.config.as_deref())?;
    if let Some(input) = args.input {
        config.uri = input;
    }
    anyhow::ensure!(!config.uri.is_empty(), "no input given");
    config.auto_play = true;
    config.decode_video &= !args.no_video;
    config.decode_audio &= !args.no_audio;
    config.looping |= args.looping;

    let mut player = AvPlayer::new(config, backend, Handle::current());
    let mut events = player.event_stream();
    player.prepare()?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupted");
                player.stop();
                return Ok(());
            }
            event = events.next() => match event {
                Some(PlayerEvent::Format(info)) => log::info!("format: {:?}", info),
                Some(PlayerEvent::Progress(p)) => log::info!("progress {:.2}%", p),
                Some(PlayerEvent::Error(msg)) => anyhow::bail!("playback failed: {}", msg),
                Some(PlayerEvent::End) | None => return Ok(()),
                Some(_) => {}
            },
        }
    }
}

async fn clip(args: ClipArgs, backend: Arc<dyn CodecBackend>) -> anyhow::Result<()> {
    let mut config: ClipConfig = load_config(args.config.as_deref())?;
    if let Some(input) = args.input {
        config.input = input;
    }
    if let Some(output) = args.output {
        config.output = output;
    }
    anyhow::ensure!(
        !config.input.is_empty() && !config.output.is_empty(),
        "input and output are required"
    );
    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    if let Some((w, h)) = args.crop {
        config = config.with_crop(w, h);
    }
    config.margin_left = args.left.unwrap_or(config.margin_left);
    config.margin_top = args.top.unwrap_or(config.margin_top);
    if let Some(clarity) = args.clarity {
        config.clarity = clarity;
    }
    config.keep_audio &= !args.no_audio;

    let task = ClipTask::new(config, backend, Handle::current());
    let mut events = task.event_stream();
    let cancel = task.cancel_token();
    let handle = task.start();

    let report = async {
        while let Some(event) = events.next().await {
            match event {
                ClipEvent::Progress(p) => log::info!("progress {:.2}%", p),
                ClipEvent::End | ClipEvent::Error(_) => break,
                ClipEvent::Start => log::info!("clip started"),
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted");
            cancel.cancel();
        }
        _ = report => {}
    }
    handle.await??;
    Ok(())
}

fn probe(input: &str, backend: &dyn CodecBackend) -> anyhow::Result<()> {
    let mut demuxer = backend.open_source(input)?;
    println!("{input}");
    for index in 0..demuxer.track_count() {
        match demuxer.track_format(index) {
            Ok(format) if format.is_video() => println!(
                "  #{index} {} {}x{} {} fps {} ms",
                format.mime,
                format.width,
                format.height,
                format.frame_rate,
                format.duration_ms()
            ),
            Ok(format) => println!(
                "  #{index} {} {} Hz {} ch {} ms",
                format.mime,
                format.sample_rate,
                format.channels,
                format.duration_ms()
            ),
            Err(e) => println!("  #{index} unreadable: {e}"),
        }
    }
    for kind in [codec_bus::MediaKind::Video, codec_bus::MediaKind::Audio] {
        if let Some((index, _)) = find_track(demuxer.as_ref(), kind)? {
            println!("  {kind}: #{index}");
        }
    }
    demuxer.release();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    codec_bus::init()?;
    let backend: Arc<dyn CodecBackend> = Arc::new(FfmpegBackend::new());

    match Cli::parse().command {
        Command::Play(args) => play(args, backend).await,
        Command::Clip(args) => clip(args, backend).await,
        Command::Probe { input } => probe(&input, backend.as_ref()),
    }
}
