//! Lock-free Single-Producer Single-Consumer 音频传输环形缓冲区
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作，读写互为 wait-free
//! - 零分配：所有内存在初始化时预分配
//! - 缓存友好：游标使用 `CachePadded` 避免 false sharing
//! - 内存锁定：可选 mlock 防止 page fault
//!
//! 用于解码/重采样线程（生产者）和硬件 render callback（消费者）之间的数据传递。
//!
//! 溢出策略：写入永远全部接受。空间不足时丢弃最旧的未读帧（推进读游标），
//! 每次触发溢出的 `write` 只计一次 overrun。读不够时返回实际帧数，计一次 underrun。
//!
//! 游标是单调递增的帧计数（u64，不回绕），存储偏移 = 游标 % 容量。
//! 读游标可能被三方推进（消费者读、生产者溢出、控制面 flush），
//! 因此一律用 `fetch_max`，保证游标永不后退。
//!
//! **溢出与并发读：** 溢出时生产者先推进读游标，再覆写旧槽位，
//! 此时消费者可能正在拷贝同一区域。槽位是原子 `u32`（样本的位模式），不会出现 UB。
//! 消费者拷贝后重新检查读游标：被推过的帧（已计入 overrun）从结果中剔除，
//! 因此交付给调用方的帧严格 FIFO，同一帧绝不会被交付两次，也不会交付被覆写的槽位。
//! 读游标快照过期（距离超过容量）时重新加载一次即可得到一致的区间。

use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use thiserror::Error;

use super::format::StreamFormat;
use super::stats::Telemetry;

/// 构造参数错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("ring buffer capacity must be at least one frame")]
    ZeroCapacity,
    #[error("ring buffer needs at least one channel")]
    ZeroChannels,
    #[error("{capacity_frames} frames x {channels} channels overflows sample storage")]
    StorageOverflow {
        capacity_frames: usize,
        channels: usize,
    },
}

/// SPSC 无锁环形缓冲区（交织 f32 样本）
///
/// 内存布局保证：
/// - write_pos / read_pos / generation 各自独占一个 cache line
/// - storage 长度 = capacity * channels，构造后永不重新分配
pub struct RingBuffer {
    storage: Box<[AtomicU32]>,
    capacity: usize,
    channels: usize,

    write_pos: CachePadded<AtomicU64>,
    read_pos: CachePadded<AtomicU64>,
    generation: CachePadded<AtomicU64>,

    underruns: AtomicU64,
    overruns: AtomicU64,

    // 是否已锁定内存
    memory_locked: AtomicBool,
}

impl RingBuffer {
    /// 创建指定容量（帧）和声道数的 Ring Buffer
    ///
    /// 容量不要求是 2 的幂，索引使用取模运算。
    pub fn new(capacity_frames: usize, channels: usize) -> Result<Self, RingBufferError> {
        if capacity_frames == 0 {
            return Err(RingBufferError::ZeroCapacity);
        }
        if channels == 0 {
            return Err(RingBufferError::ZeroChannels);
        }
        let sample_count =
            capacity_frames
                .checked_mul(channels)
                .ok_or(RingBufferError::StorageOverflow {
                    capacity_frames,
                    channels,
                })?;

        let storage: Vec<AtomicU32> = (0..sample_count)
            .map(|_| AtomicU32::new(0f32.to_bits()))
            .collect();

        Ok(Self {
            storage: storage.into_boxed_slice(),
            capacity: capacity_frames,
            channels,
            write_pos: CachePadded::new(AtomicU64::new(0)),
            read_pos: CachePadded::new(AtomicU64::new(0)),
            generation: CachePadded::new(AtomicU64::new(0)),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            memory_locked: AtomicBool::new(false),
        })
    }

    /// 按格式和时长创建：容量 = 该时长对应的帧数（至少 1 帧）
    pub fn for_format(format: StreamFormat, duration: Duration) -> Result<Self, RingBufferError> {
        let frames = format.frames_for(duration).max(1);
        Self::new(frames, format.samples_per_frame())
    }

    /// 写入交织样本（生产者调用）
    ///
    /// 实际帧数 = min(frame_count, samples.len() / channels)，永远全部接受并返回该值。
    /// 超过容量时只保留最新的 capacity 帧，写游标仍推进完整帧数。
    /// 此函数是 wait-free 的，绝不阻塞、绝不分配
    #[inline]
    pub fn write(&self, samples: &[f32], frame_count: usize) -> usize {
        let frames = frame_count.min(samples.len() / self.channels);
        if frames == 0 {
            return 0;
        }

        let kept = frames.min(self.capacity);
        let skipped = frames - kept;
        let source = &samples[skipped * self.channels..frames * self.channels];

        let capacity = self.capacity as u64;
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let new_write = write + frames as u64;

        // 溢出：先把读游标推到新写游标后的最早有效帧，再覆写槽位
        let floor = new_write.saturating_sub(capacity);
        if read < floor {
            // 旧值可能已被消费者推过 floor，此时并未真正丢帧
            let previous = self.read_pos.fetch_max(floor, Ordering::AcqRel);
            if previous < floor {
                self.overruns.fetch_add(1, Ordering::Relaxed);
            }
        }

        // 与 commit_read 的 Acquire fence 配对：读到本次覆写值的消费者，
        // 一定能看到覆写前已推进的读游标（溢出或 flush）
        fence(Ordering::Release);
        self.store_frames(new_write - kept as u64, source);

        // 发布：数据先于游标可见
        self.write_pos.store(new_write, Ordering::Release);
        frames
    }

    /// 读取交织样本（消费者调用）
    ///
    /// 请求帧数 = min(frame_count, destination.len() / channels)。
    /// 返回实际读取帧数；不足时计一次 underrun。只有前 返回值 帧有效，
    /// 超出可读帧数的部分不做任何修改（静音填充由调用方负责）。
    /// 此函数是 wait-free 的，绝不阻塞、绝不分配
    #[inline]
    pub fn read(&self, destination: &mut [f32], frame_count: usize) -> usize {
        let wanted = frame_count.min(destination.len() / self.channels);
        if wanted == 0 {
            return 0;
        }

        let snapshot = self.read_pos.load(Ordering::Acquire);
        self.read_from(snapshot, destination, wanted)
    }

    /// 以给定的读游标快照完成一次读取
    ///
    /// 快照与写游标之间可能插入了一次溢出写入，由 `readable` 和 `commit_read` 修正
    fn read_from(&self, snapshot: u64, destination: &mut [f32], wanted: usize) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let (read, available) = self.readable(snapshot, write);
        let frames = wanted.min(available);

        let delivered = if frames == 0 {
            0
        } else {
            self.load_frames(read, &mut destination[..frames * self.channels]);
            self.commit_read(read, frames, destination)
        };

        if delivered < wanted {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    /// 由读游标快照和写游标得到 (有效读游标, 可读帧数)
    ///
    /// 距离超过容量说明快照早于某次溢出：生产者先推进读游标再 Release 发布写游标，
    /// 已 Acquire 看到该写游标，重新加载读游标必然落在容量之内。
    #[inline]
    fn readable(&self, snapshot: u64, write: u64) -> (u64, usize) {
        let capacity = self.capacity as u64;
        let mut read = snapshot;
        if write.saturating_sub(read) > capacity {
            read = self.read_pos.load(Ordering::Acquire);
        }
        let available = write.saturating_sub(read).min(capacity) as usize;
        (read, available)
    }

    /// 拷贝完成后提交读游标，返回可交付的帧数
    ///
    /// 拷贝期间若有溢出（或 flush）推进了读游标，被推过的帧已计入 overrun，
    /// 其槽位可能已被覆写：剔除这部分，剩余帧移到 destination 开头。
    #[inline]
    fn commit_read(&self, read: u64, frames: usize, destination: &mut [f32]) -> usize {
        fence(Ordering::Acquire);
        let current = self.read_pos.load(Ordering::Relaxed);
        let end = read + frames as u64;

        let mut delivered = frames;
        if current > read {
            let dropped = (current.min(end) - read) as usize;
            destination.copy_within(dropped * self.channels..frames * self.channels, 0);
            delivered -= dropped;
        }

        // flush 或溢出可能已把读游标推得更远，fetch_max 保证不回退
        self.read_pos.fetch_max(end, Ordering::AcqRel);
        delivered
    }

    /// 获取当前可读帧数（快照，仅供参考）
    #[inline]
    pub fn available_frames(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        self.readable(read, write).1
    }

    /// 获取当前可写空间（帧，快照，仅用于生产者节奏控制）
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.capacity - self.available_frames()
    }

    /// 获取容量（帧）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 声道数
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// 获取缓冲区填充比例（用于监控）
    #[inline]
    pub fn fill_ratio(&self) -> f64 {
        self.available_frames() as f64 / self.capacity as f64
    }

    /// 清空缓冲区，可选推进 generation
    ///
    /// 控制面调用（格式切换、流重启），不在实时路径上。
    /// 调用方应保证生产者已暂停；否则并发写入可能让缓冲区在返回后立即非空。
    /// 不重置 telemetry 计数。
    pub fn flush(&self, new_generation: bool) {
        // 空 = read == write，不把任何游标清零
        let write = self.write_pos.load(Ordering::Acquire);
        self.read_pos.fetch_max(write, Ordering::AcqRel);

        if new_generation {
            // 在游标重置之后发布，看到新 generation 的读者一定也看到 flush
            let generation = self.generation.fetch_add(1, Ordering::Release) + 1;
            log::debug!("Ring buffer flushed, generation -> {}", generation);
        } else {
            log::debug!("Ring buffer flushed");
        }
    }

    /// 当前 generation，消费者据此检测格式切换
    #[inline]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 读取 telemetry 计数（任意线程可调用）
    #[inline]
    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            underruns: self.underruns.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 在实时音频场景下，page fault 会导致严重的时序抖动。
    /// 返回是否成功锁定
    #[cfg(unix)]
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true;
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        let len = self.storage_bytes();

        // SAFETY: ptr/len 覆盖 storage 的整块分配，生命周期与 self 相同
        let result = unsafe { libc::mlock(ptr, len) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", len);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory: {}",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    #[cfg(not(unix))]
    pub fn lock_memory(&self) -> bool {
        log::warn!("Memory locking is not supported on this platform");
        false
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.swap(false, Ordering::AcqRel) {
            return;
        }

        #[cfg(unix)]
        {
            let ptr = self.storage.as_ptr() as *const libc::c_void;
            // SAFETY: 与 lock_memory 使用同一区间
            unsafe {
                libc::munlock(ptr, self.storage_bytes());
            }
        }

        log::debug!("Ring buffer memory unlocked");
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }

    fn storage_bytes(&self) -> usize {
        self.storage.len() * std::mem::size_of::<AtomicU32>()
    }

    /// 从 start_frame 对应的偏移开始写入，必要时环绕一次
    ///
    /// samples.len() 不超过 storage.len()（调用方已截断到 capacity 帧）
    #[inline]
    fn store_frames(&self, start_frame: u64, samples: &[f32]) {
        let offset = (start_frame % self.capacity as u64) as usize * self.channels;
        let first = samples.len().min(self.storage.len() - offset);
        let (head, tail) = samples.split_at(first);

        for (slot, sample) in self.storage[offset..offset + first].iter().zip(head) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
        for (slot, sample) in self.storage[..tail.len()].iter().zip(tail) {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
    }

    #[inline]
    fn load_frames(&self, start_frame: u64, output: &mut [f32]) {
        let offset = (start_frame % self.capacity as u64) as usize * self.channels;
        let first = output.len().min(self.storage.len() - offset);
        let (head, tail) = output.split_at_mut(first);

        for (sample, slot) in head.iter_mut().zip(&self.storage[offset..offset + first]) {
            *sample = f32::from_bits(slot.load(Ordering::Relaxed));
        }
        let wrapped = tail.len();
        for (sample, slot) in tail.iter_mut().zip(&self.storage[..wrapped]) {
            *sample = f32::from_bits(slot.load(Ordering::Relaxed));
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("channels", &self.channels)
            .field("available", &self.available_frames())
            .field("generation", &self.current_generation())
            .field("telemetry", &self.telemetry())
            .finish()
    }
}

/// 消费者侧 generation 跟踪
///
/// 缓存上次看到的 generation；变化意味着缓冲区刚为新格式/新会话 flush 过，
/// 与旧 epoch 绑定的插值、滤波、续播状态都应丢弃。
#[derive(Debug, Clone, Copy)]
pub struct GenerationWatch {
    seen: u64,
}

impl GenerationWatch {
    pub fn new(ring_buffer: &RingBuffer) -> Self {
        Self {
            seen: ring_buffer.current_generation(),
        }
    }

    /// 每个轮询周期调用；每次变化只报告一次
    #[inline]
    pub fn changed(&mut self, ring_buffer: &RingBuffer) -> bool {
        let current = ring_buffer.current_generation();
        if current != self.seen {
            self.seen = current;
            true
        } else {
            false
        }
    }

    pub fn generation(&self) -> u64 {
        self.seen
    }
}
