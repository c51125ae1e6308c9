//! Frame Ring - 实时音频传输缓冲区演示与压力测试
//!
//! 设计目标：
//! - render 路径零锁、零分配：lock-free SPSC ring buffer
//! - 溢出丢旧帧、欠载返回短读，永不阻塞任何一方
//! - 格式切换通过 generation 通知下游，无需重建缓冲区

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use frame_ring::audio::{StreamFormat, TelemetryMonitor};
use frame_ring::engine::{self, Engine, EngineConfig, StressConfig};

/// 主循环轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// telemetry 汇报间隔
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Frame Ring - lock-free audio transfer buffer
#[derive(Parser)]
#[command(name = "frame-ring")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tone producer and a paced render loop through the buffer
    Simulate(SimulateArgs),

    /// Hammer the buffer with a tight-loop writer and reader
    Stress(StressArgs),
}

#[derive(Args)]
struct SimulateArgs {
    /// How long to run, in seconds
    #[arg(short, long, default_value = "10")]
    seconds: u64,

    /// Buffer size in milliseconds
    #[arg(short, long, default_value = "200")]
    buffer_ms: u64,

    /// Initial sample rate
    #[arg(long, default_value = "48000")]
    rate: u32,

    /// Channel count (fixed for the session)
    #[arg(long, default_value = "2")]
    channels: u16,

    /// Producer chunk size in frames
    #[arg(long, default_value = "512")]
    chunk: usize,

    /// Random +/- jitter applied to each producer chunk
    #[arg(long, default_value = "128")]
    jitter: usize,

    /// Render quantum in frames
    #[arg(short, long, default_value = "256")]
    quantum: usize,

    /// Switch between 44.1kHz and 48kHz every N seconds (0 disables)
    #[arg(long, default_value = "3")]
    format_change_secs: u64,

    /// Lock buffer memory to avoid page faults
    #[arg(long)]
    lock_memory: bool,
}

#[derive(Args)]
struct StressArgs {
    /// Buffer capacity in frames
    #[arg(long, default_value = "4096")]
    capacity: usize,

    /// Channel count
    #[arg(long, default_value = "2")]
    channels: usize,

    /// Chunk size in frames for both sides
    #[arg(long, default_value = "128")]
    chunk: usize,

    /// Number of chunks the writer produces
    #[arg(short, long, default_value = "50000")]
    iterations: usize,

    /// Flush with a new generation every N chunks
    #[arg(long)]
    flush_every: Option<usize>,

    /// Writer waits for free space instead of overrunning
    #[arg(long)]
    paced: bool,

    /// Reader time budget in seconds
    #[arg(long, default_value = "60")]
    time_limit_secs: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Simulate(args) => simulate(&args),
        Commands::Stress(args) => stress(&args),
    }
}

/// 运行引擎：周期汇报 telemetry，按间隔切换采样率，Ctrl-C 提前结束
fn simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let config = EngineConfig {
        format: StreamFormat::new(args.rate, args.channels),
        buffer: Duration::from_millis(args.buffer_ms),
        chunk_frames: args.chunk,
        chunk_jitter_frames: args.jitter,
        quantum_frames: args.quantum,
        lock_memory: args.lock_memory,
        ..Default::default()
    };

    let mut engine = Engine::new(config).context("failed to create engine")?;
    engine.start().context("failed to start engine")?;

    println!(
        "Simulating {} for {}s, buffer {} frames (Ctrl-C to stop)",
        engine.format(),
        args.seconds,
        engine.ring_buffer().capacity()
    );

    let run_for = Duration::from_secs(args.seconds);
    let format_change = Duration::from_secs(args.format_change_secs);
    let mut monitor = TelemetryMonitor::new();
    let started = Instant::now();
    let mut last_report = started;
    let mut last_change = started;

    while !stop.load(Ordering::SeqCst) && started.elapsed() < run_for {
        thread::sleep(POLL_INTERVAL);

        if last_report.elapsed() >= REPORT_INTERVAL {
            let delta = monitor.poll(engine.ring_buffer());
            let stats = engine.stats();
            log::info!(
                "{:?} | fill {:.0}% | gen {} | +{} underruns +{} overruns",
                engine.state(),
                stats.fill_ratio * 100.0,
                stats.generation,
                delta.underruns,
                delta.overruns
            );
            last_report = Instant::now();
        }

        if !format_change.is_zero() && last_change.elapsed() >= format_change {
            let current = engine.format();
            let next_rate = if current.sample_rate == 44100 { 48000 } else { 44100 };
            engine
                .change_format(StreamFormat::new(next_rate, current.channels))
                .context("format change failed")?;
            last_change = Instant::now();
        }
    }

    let stats = engine.stats();
    engine.stop();

    println!();
    print!("{}", stats.render);
    println!("Frames written: {}", stats.frames_written);
    Ok(())
}

/// 运行并发压力测试并打印结果
fn stress(args: &StressArgs) -> anyhow::Result<()> {
    let config = StressConfig {
        capacity_frames: args.capacity,
        channels: args.channels,
        chunk_frames: args.chunk,
        iterations: args.iterations,
        flush_every: args.flush_every,
        paced: args.paced,
        time_limit: Duration::from_secs(args.time_limit_secs),
    };

    let report = engine::stress::run(&config).context("stress run failed")?;
    print!("{}", report);

    if report.timed_out {
        anyhow::bail!("reader did not finish within {}s", args.time_limit_secs);
    }
    Ok(())
}
