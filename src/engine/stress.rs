//! 并发压力测试
//!
//! 一个写线程紧循环写入固定大小的块，一个读线程以同样大小紧循环读取，
//! 读到 0 帧时 yield。可选周期性 flush(true) 模拟码率/格式切换。
//! paced 模式下写线程等待足够空间再写，不应出现任何 overrun。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::EngineError;
use crate::audio::{RingBuffer, Telemetry};

/// 压力测试配置
#[derive(Clone, Debug)]
pub struct StressConfig {
    pub capacity_frames: usize,
    pub channels: usize,
    pub chunk_frames: usize,
    pub iterations: usize,
    /// 每 N 个块由写线程 flush(true) 一次
    pub flush_every: Option<usize>,
    /// 写线程等待 free_frames() >= chunk 再写入
    pub paced: bool,
    /// 读线程的时间预算
    pub time_limit: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            capacity_frames: 4096,
            channels: 2,
            chunk_frames: 128,
            iterations: 50_000,
            flush_every: None,
            paced: false,
            time_limit: Duration::from_secs(60),
        }
    }
}

/// 压力测试结果
#[derive(Debug, Clone)]
pub struct StressReport {
    pub chunks_written: u64,
    pub frames_written: u64,
    pub frames_read: u64,
    pub telemetry: Telemetry,
    pub generation: u64,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl std::fmt::Display for StressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stress Results")?;
        writeln!(f, "==============")?;
        writeln!(f, "Chunks written: {}", self.chunks_written)?;
        writeln!(f, "Frames written: {}", self.frames_written)?;
        writeln!(f, "Frames read: {}", self.frames_read)?;
        writeln!(
            f,
            "Frames dropped or flushed: {}",
            self.frames_written.saturating_sub(self.frames_read)
        )?;
        writeln!(f, "Underruns: {}", self.telemetry.underruns)?;
        writeln!(f, "Overruns: {}", self.telemetry.overruns)?;
        writeln!(f, "Generation: {}", self.generation)?;
        writeln!(f, "Elapsed: {:.2} ms", self.elapsed.as_secs_f64() * 1000.0)?;
        if self.timed_out {
            writeln!(f, "Reader gave up: time limit reached")?;
        }
        Ok(())
    }
}

/// 运行压力测试
pub fn run(config: &StressConfig) -> Result<StressReport, EngineError> {
    if config.chunk_frames == 0 {
        return Err(EngineError::InvalidConfig("chunk size must be non-zero"));
    }

    let ring_buffer = Arc::new(RingBuffer::new(config.capacity_frames, config.channels)?);
    if config.paced && config.chunk_frames > ring_buffer.capacity() {
        return Err(EngineError::InvalidConfig("paced chunk size must fit in the buffer"));
    }
    let writer_done = Arc::new(AtomicBool::new(false));
    let abort = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let chunk = config.chunk_frames;
    let channels = config.channels;
    let iterations = config.iterations;
    let flush_every = config.flush_every.filter(|&n| n > 0);
    let paced = config.paced;
    let time_limit = config.time_limit;

    log::info!(
        "Stress: {} chunks of {} frames into {} frames x {}ch",
        iterations,
        chunk,
        config.capacity_frames,
        channels
    );

    let writer = {
        let ring_buffer = Arc::clone(&ring_buffer);
        let writer_done = Arc::clone(&writer_done);
        let abort = Arc::clone(&abort);
        thread::Builder::new()
            .name("stress-writer".to_string())
            .spawn(move || {
                let source = vec![0.25f32; chunk * channels];
                let mut frames_written = 0u64;
                let mut chunks_written = 0u64;

                'chunks: for i in 0..iterations {
                    if abort.load(Ordering::Relaxed) {
                        break;
                    }
                    while paced && ring_buffer.free_frames() < chunk {
                        if abort.load(Ordering::Relaxed) {
                            break 'chunks;
                        }
                        thread::yield_now();
                    }
                    frames_written += ring_buffer.write(&source, chunk) as u64;
                    chunks_written += 1;

                    if let Some(every) = flush_every {
                        if i > 0 && i % every == 0 {
                            ring_buffer.flush(true);
                        }
                    }
                }

                writer_done.store(true, Ordering::Release);
                (frames_written, chunks_written)
            })?
    };

    let reader = {
        let ring_buffer = Arc::clone(&ring_buffer);
        let writer_done = Arc::clone(&writer_done);
        let abort = Arc::clone(&abort);
        thread::Builder::new()
            .name("stress-reader".to_string())
            .spawn(move || {
                let mut dest = vec![0.0f32; chunk * channels];
                let target = (iterations * chunk) as u64;
                let mut frames_read = 0u64;
                let mut timed_out = false;

                while frames_read < target {
                    let n = ring_buffer.read(&mut dest, chunk);
                    frames_read += n as u64;

                    if n == 0 {
                        if writer_done.load(Ordering::Acquire)
                            && ring_buffer.available_frames() == 0
                        {
                            break;
                        }
                        if started.elapsed() >= time_limit {
                            timed_out = true;
                            abort.store(true, Ordering::Relaxed);
                            break;
                        }
                        thread::yield_now();
                    }
                }
                (frames_read, timed_out)
            })
    };

    let reader = match reader {
        Ok(handle) => handle,
        Err(e) => {
            abort.store(true, Ordering::Relaxed);
            let _ = writer.join();
            return Err(e.into());
        }
    };

    let (frames_written, chunks_written) = writer
        .join()
        .map_err(|_| EngineError::InvalidState("stress writer panicked"))?;
    let (frames_read, timed_out) = reader
        .join()
        .map_err(|_| EngineError::InvalidState("stress reader panicked"))?;

    let report = StressReport {
        chunks_written,
        frames_written,
        frames_read,
        telemetry: ring_buffer.telemetry(),
        generation: ring_buffer.current_generation(),
        elapsed: started.elapsed(),
        timed_out,
    };

    if timed_out {
        log::warn!("Stress reader hit its time limit after {} frames", frames_read);
    } else {
        log::info!("Stress finished: {}", report.telemetry);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stress_completes() {
        let config = StressConfig {
            iterations: 10_000,
            ..Default::default()
        };
        let report = run(&config).unwrap();

        assert!(!report.timed_out);
        assert_eq!(report.chunks_written, 10_000);
        assert_eq!(report.frames_written, 10_000 * 128);
        assert!(report.frames_read <= report.frames_written);
        // 每次 write 至多计一次 overrun
        assert!(report.telemetry.overruns <= report.chunks_written);
        assert_eq!(report.generation, 0);
    }

    #[test]
    fn test_stress_paced_reads_everything() {
        let config = StressConfig {
            iterations: 10_000,
            paced: true,
            ..Default::default()
        };
        let report = run(&config).unwrap();

        assert!(!report.timed_out);
        assert_eq!(report.telemetry.overruns, 0);
        assert_eq!(report.frames_written, 10_000 * 128);
        assert_eq!(report.frames_read, report.frames_written);
    }

    #[test]
    fn test_stress_with_flush() {
        let config = StressConfig {
            chunk_frames: 64,
            iterations: 20_000,
            flush_every: Some(1000),
            ..Default::default()
        };
        let report = run(&config).unwrap();

        assert!(!report.timed_out);
        assert_eq!(report.generation, 19);
        assert!(report.frames_read <= report.frames_written);
    }

    #[test]
    fn test_stress_rejects_bad_config() {
        let zero_chunk = StressConfig {
            chunk_frames: 0,
            ..Default::default()
        };
        assert!(matches!(run(&zero_chunk), Err(EngineError::InvalidConfig(_))));

        let zero_capacity = StressConfig {
            capacity_frames: 0,
            ..Default::default()
        };
        assert!(matches!(run(&zero_capacity), Err(EngineError::Buffer(_))));

        let oversized_paced = StressConfig {
            capacity_frames: 64,
            chunk_frames: 128,
            paced: true,
            ..Default::default()
        };
        assert!(matches!(run(&oversized_paced), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_report_display() {
        let report = StressReport {
            chunks_written: 2,
            frames_written: 256,
            frames_read: 200,
            telemetry: Telemetry {
                underruns: 3,
                overruns: 1,
            },
            generation: 0,
            elapsed: Duration::from_millis(5),
            timed_out: false,
        };
        let text = report.to_string();
        assert!(text.contains("Frames dropped or flushed: 56"));
        assert!(text.contains("Overruns: 1"));
    }
}
