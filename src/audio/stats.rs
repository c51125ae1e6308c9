//! 传输统计模块
//!
//! - `Telemetry`：环形缓冲区 underrun/overrun 计数快照
//! - `TelemetryMonitor`：周期轮询，发现新增计数时打日志
//! - `RenderStats`：在 render callback 中收集统计，水位采用降频采样策略减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::ring_buffer::RingBuffer;

/// 水位采样间隔：每 N 次 callback 才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// underrun/overrun 计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Telemetry {
    pub underruns: u64,
    pub overruns: u64,
}

impl Telemetry {
    /// 相对较早快照的增量
    pub fn since(&self, earlier: &Telemetry) -> Telemetry {
        Telemetry {
            underruns: self.underruns.saturating_sub(earlier.underruns),
            overruns: self.overruns.saturating_sub(earlier.overruns),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.underruns == 0 && self.overruns == 0
    }
}

impl std::fmt::Display for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "underruns={} overruns={}", self.underruns, self.overruns)
    }
}

/// telemetry 轮询器（非实时线程使用）
#[derive(Debug, Default)]
pub struct TelemetryMonitor {
    last: Telemetry,
}

impl TelemetryMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取当前计数，返回自上次轮询以来的增量
    pub fn poll(&mut self, ring_buffer: &RingBuffer) -> Telemetry {
        let current = ring_buffer.telemetry();
        let delta = current.since(&self.last);
        self.last = current;

        if delta.overruns > 0 {
            log::warn!(
                "Producer outpacing playback: {} overrun(s), oldest frames dropped",
                delta.overruns
            );
        }
        if delta.underruns > 0 {
            log::warn!("Render starved: {} underrun(s)", delta.underruns);
        }
        delta
    }

    /// 最近一次轮询看到的累计值
    pub fn last(&self) -> Telemetry {
        self.last
    }
}

/// render 侧统计收集器
///
/// 所有操作都是 lock-free 的，适合在音频回调中使用
#[derive(Debug)]
pub struct RenderStats {
    callback_count: AtomicU64,
    frames_rendered: AtomicU64,
    silent_frames: AtomicU64,
    generation_resets: AtomicU64,

    // 水位（帧），降频采样
    water_min: AtomicUsize,
    water_max: AtomicUsize,
}

impl RenderStats {
    pub fn new() -> Self {
        Self {
            callback_count: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            silent_frames: AtomicU64::new(0),
            generation_resets: AtomicU64::new(0),
            water_min: AtomicUsize::new(usize::MAX),
            water_max: AtomicUsize::new(0),
        }
    }

    /// 在 render callback 内调用
    ///
    /// 只在采样点才读水位，减少开销
    #[inline]
    pub fn on_callback(&self, ring_buffer: &RingBuffer) {
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            let level = ring_buffer.available_frames();
            self.water_min.fetch_min(level, Ordering::Relaxed);
            self.water_max.fetch_max(level, Ordering::Relaxed);
        }
    }

    /// 记录一次 callback 的结果：读到的帧数与静音填充的帧数
    #[inline]
    pub fn record_quantum(&self, frames_read: usize, frames_silent: usize) {
        self.frames_rendered
            .fetch_add(frames_read as u64, Ordering::Relaxed);
        self.silent_frames
            .fetch_add(frames_silent as u64, Ordering::Relaxed);
    }

    /// 记录 generation 变化导致的 render 状态重置
    #[inline]
    pub fn record_generation_reset(&self) {
        self.generation_resets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn silent_frames(&self) -> u64 {
        self.silent_frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn generation_resets(&self) -> u64 {
        self.generation_resets.load(Ordering::Relaxed)
    }

    /// 生成报告
    pub fn report(&self, ring_buffer: &RingBuffer) -> StatsReport {
        let water_min = self.water_min.load(Ordering::Relaxed);
        let water_max = self.water_max.load(Ordering::Relaxed);
        // 尚未采样时 min 仍是初始哨兵值
        let water_stats = if water_min == usize::MAX {
            WaterLevelStats { min: 0, max: 0 }
        } else {
            WaterLevelStats {
                min: water_min,
                max: water_max,
            }
        };

        StatsReport {
            callback_count: self.callback_count(),
            sample_interval: SAMPLE_INTERVAL,
            frames_rendered: self.frames_rendered(),
            silent_frames: self.silent_frames(),
            generation_resets: self.generation_resets(),
            water_stats,
            capacity: ring_buffer.capacity(),
            generation: ring_buffer.current_generation(),
            telemetry: ring_buffer.telemetry(),
        }
    }
}

impl Default for RenderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub callback_count: u64,
    pub sample_interval: u64,
    pub frames_rendered: u64,
    pub silent_frames: u64,
    pub generation_resets: u64,
    pub water_stats: WaterLevelStats,
    pub capacity: usize,
    pub generation: u64,
    pub telemetry: Telemetry,
}

#[derive(Debug, Clone, Copy)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Transfer Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Render callbacks: {}", self.callback_count)?;
        writeln!(f, "Frames rendered: {}", self.frames_rendered)?;

        let total = self.frames_rendered + self.silent_frames;
        let silent_pct = if total > 0 {
            self.silent_frames as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        writeln!(
            f,
            "Silence filled: {} frames ({:.1}%)",
            self.silent_frames, silent_pct
        )?;
        writeln!(f)?;

        writeln!(
            f,
            "Ring Buffer Water Level (every {} callbacks):",
            self.sample_interval
        )?;
        writeln!(f, "  Capacity: {} frames", self.capacity)?;
        writeln!(f, "  Min: {} frames", self.water_stats.min)?;
        writeln!(f, "  Max: {} frames", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Generation: {}", self.generation)?;
        writeln!(f, "Render state resets: {}", self.generation_resets)?;
        writeln!(f, "Underruns: {}", self.telemetry.underruns)?;
        writeln!(f, "Overruns: {}", self.telemetry.overruns)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_since() {
        let earlier = Telemetry {
            underruns: 3,
            overruns: 1,
        };
        let later = Telemetry {
            underruns: 5,
            overruns: 1,
        };
        assert_eq!(
            later.since(&earlier),
            Telemetry {
                underruns: 2,
                overruns: 0
            }
        );
        // 计数不会倒退，反向求差饱和为 0
        assert!(earlier.since(&later).is_clean());
    }

    #[test]
    fn test_monitor_reports_delta_once() {
        let rb = RingBuffer::new(8, 1).unwrap();
        let mut monitor = TelemetryMonitor::new();
        let mut dest = [0.0f32; 8];

        rb.read(&mut dest, 8);
        assert_eq!(monitor.poll(&rb).underruns, 1);
        assert!(monitor.poll(&rb).is_clean());
        assert_eq!(monitor.last().underruns, 1);
    }

    #[test]
    fn test_render_stats_water_level() {
        let rb = RingBuffer::new(64, 2).unwrap();
        let stats = RenderStats::new();

        rb.write(&[0.0; 40], 20);
        stats.on_callback(&rb); // 采样点：count 0
        stats.record_quantum(16, 0);
        stats.record_quantum(4, 12);
        stats.record_generation_reset();

        let report = stats.report(&rb);
        assert_eq!(report.callback_count, 1);
        assert_eq!(report.frames_rendered, 20);
        assert_eq!(report.silent_frames, 12);
        assert_eq!(report.generation_resets, 1);
        assert_eq!(report.water_stats.min, 20);
        assert_eq!(report.water_stats.max, 20);
        assert!(report.to_string().contains("Silence filled: 12 frames"));
    }

    #[test]
    fn test_report_without_samples() {
        let rb = RingBuffer::new(8, 1).unwrap();
        let report = RenderStats::new().report(&rb);
        assert_eq!(report.water_stats.min, 0);
        assert_eq!(report.water_stats.max, 0);
    }
}
