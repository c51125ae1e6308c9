//! 流格式
//!
//! 环形缓冲区内部统一为交织 f32，格式只决定帧率和每帧样本数，
//! 用于计算缓冲区容量和 render 周期。

use std::time::Duration;

/// 音频流格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl StreamFormat {
    /// 创建新的流格式
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 给定时长对应的帧数（向下取整）
    pub fn frames_for(&self, duration: Duration) -> usize {
        let frames = self.sample_rate as u128 * duration.as_nanos() / 1_000_000_000;
        usize::try_from(frames).unwrap_or(usize::MAX)
    }

    /// 给定帧数对应的时长；采样率为 0 时返回 0
    pub fn duration_of(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = frames as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self::new(48000, 2)
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz {}ch", self.sample_rate, self.channels)
    }
}
