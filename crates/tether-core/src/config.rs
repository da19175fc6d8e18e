//! 运行时配置：回退反应器与管道引擎的可调参数。
//!
//! # 设计背景（Why）
//! - 所有 I/O 最终在 Tokio 反应器上执行；若调用方不在任何 Tokio 运行时中发起操作，
//!   需要一个进程级回退运行时，其线程数与线程名需要可配置；
//! - 管道引擎按块执行系统调用，块大小决定单次回调携带的最大字节数。
//!
//! # 契约说明（What）
//! - 所有配置均为不可变值对象，通过 `with_*` 构建；
//! - [`ReactorConfig::from_env`] 读取 `TETHER_REACTOR_WORKERS` 与 `TETHER_REACTOR_THREAD_NAME`，
//!   解析失败时回落到默认值并记录 `warn!`。

use std::env;

use tracing::warn;

/// 回退反应器的环境变量：工作线程数。
pub const ENV_REACTOR_WORKERS: &str = "TETHER_REACTOR_WORKERS";
/// 回退反应器的环境变量：线程名前缀。
pub const ENV_REACTOR_THREAD_NAME: &str = "TETHER_REACTOR_THREAD_NAME";

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_THREAD_NAME: &str = "tether-reactor";
const DEFAULT_CHUNK: usize = 64 * 1024;

/// 进程级回退反应器的配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorConfig {
    worker_threads: usize,
    thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKERS,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置工作线程数，`0` 被钳制为 `1`。
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads.max(1);
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// 从环境变量读取配置，缺失项使用默认值。
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var(ENV_REACTOR_WORKERS) {
            match raw.trim().parse::<usize>() {
                Ok(workers) => config = config.with_worker_threads(workers),
                Err(err) => warn!(
                    variable = ENV_REACTOR_WORKERS,
                    value = %raw,
                    error = %err,
                    "ignoring malformed reactor worker count"
                ),
            }
        }
        if let Ok(name) = env::var(ENV_REACTOR_THREAD_NAME)
            && !name.trim().is_empty()
        {
            config = config.with_thread_name(name.trim());
        }
        config
    }
}

/// 管道引擎的块大小配置。
///
/// - `read_chunk`：单次读系统调用的最大字节数，亦即单次读回调携带的最大块；
/// - `write_chunk`：单次写系统调用提交的最大字节数，决定写回调的最小推进粒度。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeConfig {
    read_chunk: usize,
    write_chunk: usize,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_CHUNK,
            write_chunk: DEFAULT_CHUNK,
        }
    }
}

impl PipeConfig {
    pub const fn new() -> Self {
        Self {
            read_chunk: DEFAULT_CHUNK,
            write_chunk: DEFAULT_CHUNK,
        }
    }

    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    pub fn with_write_chunk(mut self, write_chunk: usize) -> Self {
        self.write_chunk = write_chunk.max(1);
        self
    }

    pub fn read_chunk(&self) -> usize {
        self.read_chunk
    }

    pub fn write_chunk(&self) -> usize {
        self.write_chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes_are_clamped() {
        let config = PipeConfig::new().with_read_chunk(0).with_write_chunk(0);
        assert_eq!(config.read_chunk(), 1);
        assert_eq!(config.write_chunk(), 1);
        assert_eq!(ReactorConfig::new().with_worker_threads(0).worker_threads(), 1);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = ReactorConfig::new()
            .with_worker_threads(4)
            .with_thread_name("io");
        assert_eq!(config.worker_threads(), 4);
        assert_eq!(config.thread_name(), "io");
    }
}
