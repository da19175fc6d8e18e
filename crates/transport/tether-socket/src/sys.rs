//! 原始 `setsockopt`/`getsockopt` 调用。
//!
//! `socket2` 只为常见选项提供类型化方法；`(level, name, value)` 三元组需要直达系统调用，
//! 该模块是整个 crate 中唯一允许 `unsafe` 的位置。
#![allow(unsafe_code)]

use std::{
    io, mem,
    os::fd::{AsRawFd, RawFd},
};

use libc::{c_int, c_void, socklen_t};

/// `getsockopt` 读取缓冲的上限；覆盖 `struct linger`、`struct timeval` 与常见的结构化选项。
const OPTION_BUFFER: usize = 256;

pub(crate) fn set_option_int(
    fd: &impl AsRawFd,
    level: c_int,
    name: c_int,
    value: c_int,
) -> io::Result<()> {
    set_option_raw(fd, level, name, &value.to_ne_bytes())
}

pub(crate) fn set_option_raw(
    fd: &impl AsRawFd,
    level: c_int,
    name: c_int,
    value: &[u8],
) -> io::Result<()> {
    let raw: RawFd = fd.as_raw_fd();
    let length = socklen_t::try_from(value.len())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: `value` 在调用期间保持借用，指针与长度来自同一切片；内核只读取 `length` 字节。
    let ret = unsafe { libc::setsockopt(raw, level, name, value.as_ptr().cast::<c_void>(), length) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub(crate) fn get_option_raw(
    fd: &impl AsRawFd,
    level: c_int,
    name: c_int,
) -> io::Result<Vec<u8>> {
    let raw: RawFd = fd.as_raw_fd();
    let mut buffer = vec![0u8; OPTION_BUFFER];
    let mut length = OPTION_BUFFER as socklen_t;
    // SAFETY: 缓冲区可写且长度为 `length`；内核回写的长度不超过传入值。
    let ret = unsafe {
        libc::getsockopt(
            raw,
            level,
            name,
            buffer.as_mut_ptr().cast::<c_void>(),
            &mut length,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    buffer.truncate((length as usize).min(OPTION_BUFFER));
    Ok(buffer)
}

/// 将 `getsockopt` 返回的字节解释为整数选项值。
pub(crate) fn decode_int(raw: &[u8]) -> Option<c_int> {
    let bytes: [u8; mem::size_of::<c_int>()] =
        raw.get(..mem::size_of::<c_int>())?.try_into().ok()?;
    Some(c_int::from_ne_bytes(bytes))
}
