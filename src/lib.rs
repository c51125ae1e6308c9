//! Frame Ring Library
//!
//! 实时音频传输缓冲区：解码/重采样线程与硬件 render callback 之间的
//! lock-free SPSC 环形缓冲区，以及驱动它的测试引擎。

pub mod audio;
pub mod engine;

pub use audio::{GenerationWatch, RingBuffer, RingBufferError, StreamFormat, Telemetry};
