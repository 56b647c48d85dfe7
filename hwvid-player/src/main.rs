//! # hwvid Player
//!
//! Headless playback through the hwvid pipeline. Coded units come from the
//! synthetic demuxer and are decoded by the loopback component, so the whole
//! session, scheduling and sync path runs without decode hardware.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use hwvid_core::hardware::{CodecFormat, DecoderRegistry};
use hwvid_core::loopback::{LoopbackConfig, LoopbackLoader, RecordingSink, SyntheticDemuxer};
use hwvid_core::{Pipeline, PipelineConfig, PipelineStats};

// ============================================================================
// Options
// ============================================================================

struct PlayerOptions {
    format: CodecFormat,
    frames: u64,
    fps: u32,
    reorder: bool,
    config: Option<PathBuf>,
    dump_config: bool,
    seek_ms: Option<i64>,
    audio_lag_ms: Option<i64>,
    decoder_latency_ms: i64,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            format: CodecFormat::H264,
            frames: 120,
            fps: 30,
            reorder: true,
            config: None,
            dump_config: false,
            seek_ms: None,
            audio_lag_ms: None,
            decoder_latency_ms: 0,
        }
    }
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut options = PlayerOptions::default();

    let value = |i: usize, flag: &str| -> Result<&String> {
        args.get(i + 1)
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--format" | "-f" => {
                let name = value(i, "--format")?;
                options.format = CodecFormat::from_name(name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown format {:?}", name))?;
                i += 2;
            }
            "--frames" | "-n" => {
                let v = value(i, "--frames")?;
                options.frames = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid frame count {}: {}", v, e))?;
                i += 2;
            }
            "--fps" => {
                let v = value(i, "--fps")?;
                options.fps = v.parse().map_err(|e| anyhow::anyhow!("Invalid fps {}: {}", v, e))?;
                if options.fps == 0 {
                    return Err(anyhow::anyhow!("--fps must be at least 1"));
                }
                i += 2;
            }
            "--no-reorder" => {
                options.reorder = false;
                i += 1;
            }
            "--config" | "-c" => {
                options.config = Some(PathBuf::from(value(i, "--config")?));
                i += 2;
            }
            "--dump-config" => {
                options.dump_config = true;
                i += 1;
            }
            "--seek" => {
                let v = value(i, "--seek")?;
                options.seek_ms = Some(v.parse().map_err(|e| anyhow::anyhow!("Invalid seek {}: {}", v, e))?);
                i += 2;
            }
            "--audio-lag" => {
                let v = value(i, "--audio-lag")?;
                options.audio_lag_ms = Some(v.parse().map_err(|e| anyhow::anyhow!("Invalid lag {}: {}", v, e))?);
                i += 2;
            }
            "--decoder-latency" => {
                let v = value(i, "--decoder-latency")?;
                options.decoder_latency_ms =
                    v.parse().map_err(|e| anyhow::anyhow!("Invalid latency {}: {}", v, e))?;
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {:?}", other);
                i += 1;
            }
        }
    }
    Ok(options)
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  hwvid [--format h264] [--frames <n>] [--fps <n>] [--no-reorder]\n        \
         [--config <file.json>] [--dump-config] [--seek <ms>]\n        \
         [--audio-lag <ms>] [--decoder-latency <ms>]\n"
    );
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hwvid=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let mut config = match &options.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if options.audio_lag_ms.is_some() {
        config.audio_master = true;
    }
    if options.dump_config {
        println!("{}", config.to_json()?);
        return Ok(());
    }

    tracing::info!("hwvid Player v{}", hwvid_core::VERSION);
    let stats = play(&options, config)?;
    report(&stats);
    Ok(())
}

fn play(options: &PlayerOptions, config: PipelineConfig) -> Result<PipelineStats> {
    let loader = Arc::new(LoopbackLoader::new(LoopbackConfig {
        latency_us: options.decoder_latency_ms * 1000,
        ..LoopbackConfig::default()
    }));
    let mut registry = DecoderRegistry::new();
    loader.register(&mut registry, options.format, &["loopback.primary"]);

    let demuxer = SyntheticDemuxer::new(options.format, options.frames, options.fps, options.reorder);
    let frame_us = demuxer.frame_duration_us();
    let sink = RecordingSink::new();

    tracing::info!(
        "Playing {} synthetic {:?} frames at {} fps",
        options.frames,
        options.format,
        options.fps
    );
    let mut pipeline = Pipeline::start(&registry, Box::new(demuxer), Box::new(sink.clone()), config)?;

    let duration = Duration::from_micros((options.frames as i64 * frame_us).max(0) as u64);
    let deadline = Instant::now() + duration + Duration::from_secs(5);
    let mut seek = options.seek_ms;
    let tick = Duration::from_millis(20);

    while !pipeline.is_finished() && Instant::now() < deadline {
        if let Some(lag_ms) = options.audio_lag_ms {
            pipeline.report_audio_time(pipeline.media_time_us() - lag_ms * 1000);
        }
        // Seek once playback is under way
        if let Some(target_ms) = seek {
            if pipeline.media_time_us() > 200_000 {
                tracing::info!("Seeking to {}ms", target_ms);
                pipeline.seek(target_ms * 1000);
                seek = None;
            }
        }
        std::thread::sleep(tick);
    }

    let stats = pipeline.wait(Duration::from_secs(5))?;
    tracing::info!("Sink showed {} frames", sink.shown().len());
    Ok(stats)
}

fn report(stats: &PipelineStats) {
    let s = &stats.session;
    tracing::info!(
        "Decode: fed={} ({} bytes), output={}, discarded={}, reconfigured={}, flushes={}",
        s.units_fed,
        s.bytes_fed,
        s.frames_output,
        s.decode_only_discarded,
        s.reconfigurations,
        s.flushes
    );

    let p = &stats.scheduler;
    tracing::info!(
        "Presentation: rendered={}, dropped={}, forced={}, worst drop run={}",
        p.rendered,
        p.dropped,
        p.forced,
        p.max_consecutive_drops
    );

    let a = &stats.sync;
    tracing::info!(
        "Sync: samples={}, delay={}us, skips={}, latch timeouts={}",
        a.samples,
        a.smoothed_delay_us,
        a.skips_requested,
        a.latch_timeouts
    );

    tracing::info!(
        "Frame pool: {}/{} free, skipped units={}, pool growths={}, seeks={}",
        stats.frame_pool.available,
        stats.frame_pool.capacity,
        stats.skipped_units,
        stats.pool_growths,
        stats.seeks
    );
}
