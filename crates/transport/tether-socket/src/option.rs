//! 套接字选项：`(level, name, value)` 三元组。

use std::os::fd::AsRawFd;

use bytes::Bytes;
use tether_core::error::{SocketError, SocketErrorKind};

use crate::sys;

/// 选项取值：整数或原始字节。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OptionValue {
    Int(i32),
    Raw(Bytes),
}

/// 一条待应用的套接字选项，一一映射到 `setsockopt(level, name, value)`。
///
/// 选项在描述符创建之后、`bind`/`connect` 之前按追加顺序应用；
/// 内核拒绝时以 [`SocketErrorKind::SetOption`] 失败并携带 `(level, name)`。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocketOption {
    level: i32,
    name: i32,
    value: OptionValue,
}

impl SocketOption {
    pub fn int(level: i32, name: i32, value: i32) -> Self {
        Self {
            level,
            name,
            value: OptionValue::Int(value),
        }
    }

    pub fn raw(level: i32, name: i32, value: impl Into<Bytes>) -> Self {
        Self {
            level,
            name,
            value: OptionValue::Raw(value.into()),
        }
    }

    /// `SOL_SOCKET`/`SO_REUSEADDR` = 1。
    pub fn reuse_address() -> Self {
        Self::int(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn name(&self) -> i32 {
        self.name
    }

    pub fn value(&self) -> &OptionValue {
        &self.value
    }

    /// 整数形式的取值；原始字节恰为一个本机序 `int` 时同样可读。
    pub fn int_value(&self) -> Option<i32> {
        match &self.value {
            OptionValue::Int(value) => Some(*value),
            OptionValue::Raw(raw) if raw.len() == std::mem::size_of::<i32>() => {
                sys::decode_int(raw)
            }
            OptionValue::Raw(_) => None,
        }
    }

    pub(crate) fn apply(&self, fd: &impl AsRawFd) -> Result<(), SocketError> {
        let result = match &self.value {
            OptionValue::Int(value) => sys::set_option_int(fd, self.level, self.name, *value),
            OptionValue::Raw(raw) => sys::set_option_raw(fd, self.level, self.name, raw),
        };
        result.map_err(|err| {
            SocketError::from_io(
                SocketErrorKind::SetOption {
                    level: self.level,
                    name: self.name,
                },
                err,
            )
        })
    }
}

/// 读取选项的原始字节。
pub(crate) fn read_option(
    fd: &impl AsRawFd,
    level: i32,
    name: i32,
) -> Result<Bytes, SocketError> {
    sys::get_option_raw(fd, level, name)
        .map(Bytes::from)
        .map_err(|err| SocketError::from_io(SocketErrorKind::GetOption { level, name }, err))
}
