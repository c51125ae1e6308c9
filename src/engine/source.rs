//! 测试信号源
//!
//! 代替解码器充当生产者：按当前格式生成交织的正弦波。

use std::f32::consts::TAU;

use crate::audio::StreamFormat;

/// 正弦波信号源
#[derive(Debug, Clone)]
pub struct ToneSource {
    format: StreamFormat,
    frequency: f32,
    amplitude: f32,
    // 归一化相位 [0, 1)
    phase: f32,
    step: f32,
}

impl ToneSource {
    pub fn new(format: StreamFormat, frequency: f32) -> Self {
        let mut source = Self {
            format,
            frequency,
            amplitude: 0.5,
            phase: 0.0,
            step: 0.0,
        };
        source.set_format(format);
        source
    }

    /// 切换格式：重新计算相位步进，相位归零
    pub fn set_format(&mut self, format: StreamFormat) {
        self.format = format;
        self.phase = 0.0;
        self.step = if format.sample_rate > 0 {
            self.frequency / format.sample_rate as f32
        } else {
            0.0
        };
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// 填充交织样本，返回写入的完整帧数（尾部不足一帧的样本保持不变）
    pub fn fill(&mut self, output: &mut [f32]) -> usize {
        let channels = self.format.samples_per_frame().max(1);
        let mut frames = 0;

        for frame in output.chunks_exact_mut(channels) {
            let value = self.amplitude * (self.phase * TAU).sin();
            frame.fill(value);
            self.phase = (self.phase + self.step).fract();
            frames += 1;
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_interleaved() {
        let mut source = ToneSource::new(StreamFormat::new(48000, 2), 1000.0);
        let mut output = [9.0f32; 9];

        assert_eq!(source.fill(&mut output), 4);
        // 相位从 0 开始
        assert_eq!(output[0], 0.0);
        // 同一帧的各声道相同
        for frame in output[..8].chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
        // 不足一帧的尾部不动
        assert_eq!(output[8], 9.0);
    }

    #[test]
    fn test_quarter_period_peak() {
        // 4 帧一个周期：第 2 帧在 1/4 周期处取峰值
        let mut source = ToneSource::new(StreamFormat::new(4, 1), 1.0);
        let mut output = [0.0f32; 4];
        source.fill(&mut output);
        assert!((output[1] - 0.5).abs() < 1e-6);
        assert!(output.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn test_set_format_resets_phase() {
        let mut source = ToneSource::new(StreamFormat::new(44100, 1), 440.0);
        let mut output = [0.0f32; 100];
        source.fill(&mut output);

        source.set_format(StreamFormat::new(48000, 1));
        let mut first = [1.0f32; 1];
        source.fill(&mut first);
        assert_eq!(first[0], 0.0);
        assert_eq!(source.format().sample_rate, 48000);
    }
}
