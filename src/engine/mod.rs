//! 传输引擎
//!
//! 整合信号源、环形缓冲区、render 循环
//! 核心设计：生产线程和 render 回调完全解耦，通过 lock-free ring buffer 连接；
//! 格式切换由控制面暂停生产者后 flush(true)，render 侧通过 generation 感知。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::audio::{
    GenerationWatch, RenderStats, RingBuffer, RingBufferError, StatsReport, StreamFormat,
    Telemetry,
};

pub mod source;
pub mod stress;

pub use source::ToneSource;
pub use stress::{StressConfig, StressReport};

/// 等待生产者确认暂停的上限
const PAUSE_TIMEOUT: Duration = Duration::from_secs(1);

/// generation 变化后 render 侧淡入的帧数
const FADE_IN_FRAMES: usize = 64;

/// 测试信号频率
const TONE_HZ: f32 = 440.0;

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Buffering,
    Running,
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 初始流格式；声道数决定缓冲区布局，之后不可更改
    pub format: StreamFormat,
    /// 缓冲区时长（按初始采样率换算成帧）
    pub buffer: Duration,
    /// 生产者每次写入的帧数
    pub chunk_frames: usize,
    /// 写入帧数的随机抖动（±）
    pub chunk_jitter_frames: usize,
    /// render callback 每次请求的帧数
    pub quantum_frames: usize,
    /// 预缓冲比例（0.0-1.0），render 开始消费前需要填充到这个比例
    pub prebuffer_ratio: f64,
    /// 是否 mlock 缓冲区内存
    pub lock_memory: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            format: StreamFormat::default(),
            buffer: Duration::from_millis(200),
            chunk_frames: 512,
            chunk_jitter_frames: 128,
            quantum_frames: 256,
            // 50% 预缓冲
            prebuffer_ratio: 0.5,
            lock_memory: false,
        }
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ring buffer error: {0}")]
    Buffer(#[from] RingBufferError),
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
    #[error("channel count is fixed at {expected}, got {got}")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("producer did not pause within {0:?}")]
    ProducerUnresponsive(Duration),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// 引擎统计
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// 缓冲区填充比例
    pub fill_ratio: f64,
    pub telemetry: Telemetry,
    pub generation: u64,
    /// 生产者累计写入帧数
    pub frames_written: u64,
    pub render: StatsReport,
}

/// 生产者/render 共享状态
///
/// 完全基于原子操作，无锁设计
struct SharedState {
    running: AtomicBool,
    /// 控制面请求暂停
    paused: AtomicBool,
    /// 生产者确认已停在暂停点
    idle: AtomicBool,
    prebuffered: AtomicBool,
    sample_rate: AtomicU32,
    frames_written: AtomicU64,
}

/// 传输引擎
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    ring_buffer: Arc<RingBuffer>,
    stats: Arc<RenderStats>,
    shared: Arc<SharedState>,
    producer: Option<JoinHandle<()>>,
    render: Option<JoinHandle<()>>,
}

impl Engine {
    /// 创建新引擎
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        if config.format.sample_rate == 0 {
            return Err(EngineError::InvalidConfig("sample rate must be non-zero"));
        }
        if config.chunk_frames == 0 || config.quantum_frames == 0 {
            return Err(EngineError::InvalidConfig(
                "chunk and quantum sizes must be non-zero",
            ));
        }
        if !(0.0..=1.0).contains(&config.prebuffer_ratio) {
            return Err(EngineError::InvalidConfig(
                "prebuffer ratio must be within 0.0..=1.0",
            ));
        }

        let ring_buffer = Arc::new(RingBuffer::for_format(config.format, config.buffer)?);
        if max_chunk_frames(&config) > ring_buffer.capacity() {
            return Err(EngineError::InvalidConfig(
                "producer chunk does not fit in the ring buffer",
            ));
        }
        if config.lock_memory && !ring_buffer.lock_memory() {
            log::warn!("Continuing with unlocked ring buffer memory");
        }

        let shared = Arc::new(SharedState {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            prebuffered: AtomicBool::new(false),
            sample_rate: AtomicU32::new(config.format.sample_rate),
            frames_written: AtomicU64::new(0),
        });

        log::info!(
            "Engine: {} | buffer {} frames | chunk {}±{} | quantum {}",
            config.format,
            ring_buffer.capacity(),
            config.chunk_frames,
            config.chunk_jitter_frames,
            config.quantum_frames
        );

        Ok(Self {
            config,
            state: EngineState::Stopped,
            ring_buffer,
            stats: Arc::new(RenderStats::new()),
            shared,
            producer: None,
            render: None,
        })
    }

    /// 启动生产线程和 render 线程
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Stopped {
            return Err(EngineError::InvalidState("engine already started"));
        }

        // 新会话
        self.ring_buffer.flush(true);

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.idle.store(false, Ordering::SeqCst);
        self.shared.prebuffered.store(false, Ordering::Release);
        self.shared
            .sample_rate
            .store(self.config.format.sample_rate, Ordering::Release);

        let producer = {
            let ring_buffer = Arc::clone(&self.ring_buffer);
            let shared = Arc::clone(&self.shared);
            let config = self.config.clone();
            thread::Builder::new()
                .name("producer".to_string())
                .spawn(move || producer_main(ring_buffer, shared, config))?
        };

        let render = {
            let ring_buffer = Arc::clone(&self.ring_buffer);
            let shared = Arc::clone(&self.shared);
            let stats = Arc::clone(&self.stats);
            let quantum = self.config.quantum_frames;
            thread::Builder::new()
                .name("render".to_string())
                .spawn(move || render_main(ring_buffer, shared, stats, quantum))
        };

        let render = match render {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                producer.thread().unpark();
                let _ = producer.join();
                return Err(e.into());
            }
        };

        self.producer = Some(producer);
        self.render = Some(render);
        self.state = EngineState::Running;
        Ok(())
    }

    /// 切换流格式（采样率）
    ///
    /// 暂停生产者 → flush(true) → 发布新采样率 → 恢复。
    /// 声道数由缓冲区布局固定，不能切换。
    pub fn change_format(&mut self, format: StreamFormat) -> Result<(), EngineError> {
        if format.samples_per_frame() != self.ring_buffer.channels() {
            return Err(EngineError::ChannelMismatch {
                expected: self.ring_buffer.channels(),
                got: format.samples_per_frame(),
            });
        }
        if format.sample_rate == 0 {
            return Err(EngineError::InvalidConfig("sample rate must be non-zero"));
        }
        if self.state == EngineState::Stopped {
            return Err(EngineError::InvalidState("cannot change format when stopped"));
        }

        self.pause_producer()?;

        self.ring_buffer.flush(true);
        self.shared.prebuffered.store(false, Ordering::Release);
        self.shared
            .sample_rate
            .store(format.sample_rate, Ordering::Release);
        self.config.format = format;

        self.resume_producer();

        log::info!(
            "Format changed to {} (generation {})",
            format,
            self.ring_buffer.current_generation()
        );
        Ok(())
    }

    /// 请求暂停并等待生产者确认，超时则恢复并报错
    fn pause_producer(&self) -> Result<(), EngineError> {
        // paused/idle 是双向握手，用 SeqCst 防止双方同时读到旧值
        self.shared.paused.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + PAUSE_TIMEOUT;

        while !self.shared.idle.load(Ordering::SeqCst) {
            let finished = self
                .producer
                .as_ref()
                .map_or(true, |handle| handle.is_finished());
            if finished || Instant::now() >= deadline {
                self.resume_producer();
                return Err(EngineError::ProducerUnresponsive(PAUSE_TIMEOUT));
            }
            thread::yield_now();
        }
        Ok(())
    }

    fn resume_producer(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        // 立即唤醒 park 中的生产线程
        if let Some(ref handle) = self.producer {
            handle.thread().unpark();
        }
    }

    /// 停止（幂等）
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);

        if let Some(handle) = self.producer.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("Producer thread panicked");
            }
        }
        if let Some(handle) = self.render.take() {
            if handle.join().is_err() {
                log::error!("Render thread panicked");
            }
        }

        if self.state != EngineState::Stopped {
            self.ring_buffer.flush(false);
            self.state = EngineState::Stopped;
            log::info!("Engine stopped");
        }
    }

    /// 获取当前状态
    pub fn state(&self) -> EngineState {
        if self.state == EngineState::Running && !self.shared.prebuffered.load(Ordering::Acquire)
        {
            return EngineState::Buffering;
        }
        self.state
    }

    /// 当前流格式
    pub fn format(&self) -> StreamFormat {
        self.config.format
    }

    pub fn ring_buffer(&self) -> &Arc<RingBuffer> {
        &self.ring_buffer
    }

    /// 获取统计信息
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            fill_ratio: self.ring_buffer.fill_ratio(),
            telemetry: self.ring_buffer.telemetry(),
            generation: self.ring_buffer.current_generation(),
            frames_written: self.shared.frames_written.load(Ordering::Relaxed),
            render: self.stats.report(&self.ring_buffer),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 实际抖动幅度：保证每块至少 1 帧
fn chunk_jitter(config: &EngineConfig) -> usize {
    config
        .chunk_jitter_frames
        .min(config.chunk_frames.saturating_sub(1))
}

fn max_chunk_frames(config: &EngineConfig) -> usize {
    config.chunk_frames + chunk_jitter(config)
}

/// 生产线程主函数
fn producer_main(ring_buffer: Arc<RingBuffer>, shared: Arc<SharedState>, config: EngineConfig) {
    let channels = ring_buffer.channels();
    let mut format = StreamFormat::new(
        shared.sample_rate.load(Ordering::Acquire),
        config.format.channels,
    );
    let mut source = ToneSource::new(format, TONE_HZ);
    let mut rng = rand::thread_rng();

    let jitter = chunk_jitter(&config);
    let max_chunk = max_chunk_frames(&config);
    let mut chunk = vec![0.0f32; max_chunk * channels];
    // 节奏控制下水位最高约为 capacity - max_chunk，预缓冲目标不能超过它
    let prebuffer_frames = ((ring_buffer.capacity() as f64 * config.prebuffer_ratio) as usize)
        .min(ring_buffer.capacity() - max_chunk);

    log::info!(
        "Producer thread started, prebuffer target: {} frames",
        prebuffer_frames
    );

    while shared.running.load(Ordering::Acquire) {
        // 暂停握手 - 使用 thread::park 阻塞等待，完全无锁
        // 如果 unpark 在 park 之前调用，下次 park 立即返回（无丢失唤醒）
        if shared.paused.load(Ordering::SeqCst) {
            shared.idle.store(true, Ordering::SeqCst);
            while shared.paused.load(Ordering::SeqCst) && shared.running.load(Ordering::Acquire) {
                thread::park();
            }
            shared.idle.store(false, Ordering::SeqCst);

            // 控制面可能已切换采样率
            let rate = shared.sample_rate.load(Ordering::Acquire);
            if rate != format.sample_rate {
                format = StreamFormat::new(rate, format.channels);
                source.set_format(format);
                log::info!("Producer switched to {}", format);
            }
            continue;
        }

        let frames = if jitter > 0 {
            config.chunk_frames - jitter + rng.gen_range(0..=2 * jitter)
        } else {
            config.chunk_frames
        };

        // 检查缓冲区是否有空间（仅用于节奏控制，write 本身从不拒绝）
        let free = ring_buffer.free_frames();
        if free < frames {
            let frames_needed = (frames - free) as u64;
            let wait_us = frames_needed * 1_000_000 / format.sample_rate.max(1) as u64;

            // 根据等待时间选择策略：
            // - < 50µs: 仅自旋（避免 syscall 开销）
            // - 50-500µs: yield + 短自旋
            // - > 500µs: 睡眠 70% 的预计时间
            if wait_us < 50 {
                for _ in 0..64 {
                    std::hint::spin_loop();
                }
            } else if wait_us < 500 {
                thread::yield_now();
                for _ in 0..32 {
                    std::hint::spin_loop();
                }
            } else {
                let sleep_us = (wait_us * 7 / 10).clamp(100, 10_000);
                thread::sleep(Duration::from_micros(sleep_us));
            }
            continue;
        }

        let samples = &mut chunk[..frames * channels];
        source.fill(samples);
        let written = ring_buffer.write(samples, frames);
        shared
            .frames_written
            .fetch_add(written as u64, Ordering::Relaxed);

        // 检查预缓冲是否完成
        if !shared.prebuffered.load(Ordering::Acquire)
            && ring_buffer.available_frames() >= prebuffer_frames
        {
            shared.prebuffered.store(true, Ordering::Release);
            log::info!("Prebuffer complete");
        }
    }

    log::info!("Producer thread finished");
}

/// render 线程主函数：按硬件 quantum 周期模拟 render callback
///
/// callback 内部禁止锁、分配、日志
fn render_main(
    ring_buffer: Arc<RingBuffer>,
    shared: Arc<SharedState>,
    stats: Arc<RenderStats>,
    quantum: usize,
) {
    let channels = ring_buffer.channels();
    let mut output = vec![0.0f32; quantum * channels];
    let mut watch = GenerationWatch::new(&ring_buffer);
    let mut fade_in = FadeIn::new(FADE_IN_FRAMES);
    let mut next_deadline = Instant::now();

    log::info!("Render thread started, quantum: {} frames", quantum);

    while shared.running.load(Ordering::Acquire) {
        let rate = shared.sample_rate.load(Ordering::Acquire);
        next_deadline += StreamFormat::new(rate, channels as u16).duration_of(quantum);

        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
        } else {
            // 落后于时钟：重新对齐，不追帧
            next_deadline = now;
        }

        render_quantum(
            &ring_buffer,
            &shared,
            &stats,
            &mut watch,
            &mut fade_in,
            &mut output,
            quantum,
        );
        // 真实系统中 output 在此交给硬件
    }

    log::info!("Render thread finished");
}

/// 单次 callback：检查 generation、读取、静音填充
#[inline]
fn render_quantum(
    ring_buffer: &RingBuffer,
    shared: &SharedState,
    stats: &RenderStats,
    watch: &mut GenerationWatch,
    fade_in: &mut FadeIn,
    output: &mut [f32],
    quantum: usize,
) -> usize {
    let channels = ring_buffer.channels();
    stats.on_callback(ring_buffer);

    // 旧 epoch 的状态作废
    if watch.changed(ring_buffer) {
        fade_in.reset();
        stats.record_generation_reset();
    }

    let frames_read = if shared.prebuffered.load(Ordering::Acquire) {
        ring_buffer.read(output, quantum)
    } else {
        0
    };

    // 填零
    output[frames_read * channels..].fill(0.0);
    fade_in.apply(&mut output[..frames_read * channels], channels);

    stats.record_quantum(frames_read, quantum - frames_read);
    frames_read
}

/// 淡入包络，每个 generation 重新开始，避免格式切换处的爆音
#[derive(Debug)]
struct FadeIn {
    remaining: usize,
    length: usize,
}

impl FadeIn {
    fn new(length: usize) -> Self {
        Self {
            remaining: length,
            length,
        }
    }

    fn reset(&mut self) {
        self.remaining = self.length;
    }

    fn apply(&mut self, samples: &mut [f32], channels: usize) {
        for frame in samples.chunks_exact_mut(channels) {
            if self.remaining == 0 {
                break;
            }
            let gain = 1.0 - self.remaining as f32 / self.length as f32;
            frame.iter_mut().for_each(|s| *s *= gain);
            self.remaining -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn test_shared(prebuffered: bool) -> SharedState {
        SharedState {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            prebuffered: AtomicBool::new(prebuffered),
            sample_rate: AtomicU32::new(48000),
            frames_written: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.format, StreamFormat::new(48000, 2));
        assert_eq!(config.buffer, Duration::from_millis(200));
        assert_eq!(config.prebuffer_ratio, 0.5);
    }

    #[test]
    fn test_engine_rejects_bad_config() {
        let zero_quantum = EngineConfig {
            quantum_frames: 0,
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(zero_quantum),
            Err(EngineError::InvalidConfig(_))
        ));

        let zero_rate = EngineConfig {
            format: StreamFormat::new(0, 2),
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(zero_rate),
            Err(EngineError::InvalidConfig(_))
        ));

        // 1ms @ 48kHz = 48 帧，放不下 512 帧的块
        let tiny_buffer = EngineConfig {
            buffer: Duration::from_millis(1),
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(tiny_buffer),
            Err(EngineError::InvalidConfig(_))
        ));

        let no_channels = EngineConfig {
            format: StreamFormat::new(48000, 0),
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(no_channels),
            Err(EngineError::Buffer(RingBufferError::ZeroChannels))
        ));
    }

    #[test]
    fn test_render_quantum_silence_fills() {
        let rb = RingBuffer::new(64, 2).unwrap();
        let shared = test_shared(true);
        let stats = RenderStats::new();
        let mut watch = GenerationWatch::new(&rb);
        let mut fade_in = FadeIn::new(0);
        let mut output = vec![7.0f32; 16];

        rb.write(&[0.25; 6], 3);
        let n = render_quantum(&rb, &shared, &stats, &mut watch, &mut fade_in, &mut output, 8);

        assert_eq!(n, 3);
        assert!(output[..6].iter().all(|&s| s == 0.25));
        assert!(output[6..].iter().all(|&s| s == 0.0));
        assert_eq!(stats.frames_rendered(), 3);
        assert_eq!(stats.silent_frames(), 5);
        assert_eq!(rb.telemetry().underruns, 1);
    }

    #[test]
    fn test_render_quantum_waits_for_prebuffer() {
        let rb = RingBuffer::new(64, 1).unwrap();
        let shared = test_shared(false);
        let stats = RenderStats::new();
        let mut watch = GenerationWatch::new(&rb);
        let mut fade_in = FadeIn::new(0);
        let mut output = vec![1.0f32; 8];

        rb.write(&[0.5; 8], 8);
        let n = render_quantum(&rb, &shared, &stats, &mut watch, &mut fade_in, &mut output, 8);

        // 预缓冲未完成：输出静音，不消费、不计 underrun
        assert_eq!(n, 0);
        assert!(output.iter().all(|&s| s == 0.0));
        assert_eq!(rb.available_frames(), 8);
        assert!(rb.telemetry().is_clean());
    }

    #[test]
    fn test_render_quantum_resets_on_generation() {
        let rb = RingBuffer::new(64, 1).unwrap();
        let shared = test_shared(true);
        let stats = RenderStats::new();
        let mut watch = GenerationWatch::new(&rb);
        let mut fade_in = FadeIn::new(4);
        let mut output = vec![0.0f32; 8];

        rb.write(&[1.0; 8], 8);
        render_quantum(&rb, &shared, &stats, &mut watch, &mut fade_in, &mut output, 8);
        assert_eq!(output[0], 0.0);
        assert_eq!(output[4], 1.0);
        assert_eq!(stats.generation_resets(), 0);

        rb.flush(true);
        rb.write(&[1.0; 8], 8);
        render_quantum(&rb, &shared, &stats, &mut watch, &mut fade_in, &mut output, 8);

        // 新 generation：淡入重新开始
        assert_eq!(stats.generation_resets(), 1);
        assert_eq!(output[0], 0.0);
        assert_eq!(output[2], 0.5);
        assert_eq!(output[7], 1.0);
    }

    #[test]
    fn test_fade_in_ramp() {
        let mut fade_in = FadeIn::new(4);
        let mut samples = [1.0f32; 12];
        fade_in.apply(&mut samples, 2);

        assert_eq!(&samples[..8], &[0.0, 0.0, 0.25, 0.25, 0.5, 0.5, 0.75, 0.75]);
        assert_eq!(&samples[8..], &[1.0, 1.0, 1.0, 1.0]);

        // 淡入结束后不再改变
        let mut more = [1.0f32; 4];
        fade_in.apply(&mut more, 2);
        assert_eq!(more, [1.0; 4]);
    }

    #[test]
    fn test_engine_lifecycle() {
        let config = EngineConfig {
            buffer: Duration::from_millis(100),
            ..Default::default()
        };
        let mut engine = Engine::new(config).unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.stats().generation, 0);

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::InvalidState(_))));
        assert_eq!(engine.stats().generation, 1);

        assert!(wait_for(|| engine.stats().render.frames_rendered > 0));
        assert_eq!(engine.state(), EngineState::Running);

        engine.change_format(StreamFormat::new(44100, 2)).unwrap();
        assert_eq!(engine.stats().generation, 2);
        assert_eq!(engine.format().sample_rate, 44100);

        // 渲染侧感知到新 generation
        assert!(wait_for(|| engine.stats().render.generation_resets >= 1));

        let err = engine.change_format(StreamFormat::new(44100, 1)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChannelMismatch {
                expected: 2,
                got: 1
            }
        ));

        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.ring_buffer().available_frames(), 0);
        assert!(engine.stats().frames_written > 0);

        // 幂等
        engine.stop();
    }

    #[test]
    fn test_change_format_requires_running() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        assert!(matches!(
            engine.change_format(StreamFormat::new(44100, 2)),
            Err(EngineError::InvalidState(_))
        ));
    }
}
