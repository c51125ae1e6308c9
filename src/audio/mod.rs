//! 音频传输核心模块
//!
//! 包含：
//! - Ring Buffer: Lock-free 数据传递、generation 复位
//! - Format: 流格式与帧/时长换算
//! - Stats: underrun/overrun 计数与 render 统计

pub mod format;
pub mod ring_buffer;
pub mod stats;

pub use format::StreamFormat;
pub use ring_buffer::{GenerationWatch, RingBuffer, RingBufferError};
pub use stats::{RenderStats, StatsReport, Telemetry, TelemetryMonitor};
