//! 地址族：协议族的无状态能力对象。

use std::{fmt, io};

use socket2::{Domain, Socket, Type};
use tether_core::error::{SocketError, SocketErrorKind};
use tracing::trace;

use crate::address::SocketAddress;

/// 套接字类型，对应 `socket(2)` 的 `type` 参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketType(i32);

impl SocketType {
    pub const STREAM: Self = Self(libc::SOCK_STREAM);
    pub const DGRAM: Self = Self(libc::SOCK_DGRAM);
    pub const SEQPACKET: Self = Self(libc::SOCK_SEQPACKET);

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl From<SocketType> for Type {
    fn from(ty: SocketType) -> Self {
        Type::from(ty.0)
    }
}

/// 协议族能力对象。
///
/// # 契约说明（What）
/// - [`AddressFamily::create_socket`]：创建本族的未命名描述符；本族不支持的类型以
///   [`SocketErrorKind::Create`] 失败，原因为 `EPROTOTYPE`；
/// - [`AddressFamily::parse`]：按本族布局解析原始 `sockaddr` 字节，族标签不符或长度不足时返回 `None`；
/// - 三个族均为进程级常量（[`INET4`]、[`INET6`]、[`UNIX`]），不持有任何状态。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AddressFamily {
    Inet4,
    Inet6,
    Unix,
}

pub const INET4: AddressFamily = AddressFamily::Inet4;
pub const INET6: AddressFamily = AddressFamily::Inet6;
pub const UNIX: AddressFamily = AddressFamily::Unix;

impl AddressFamily {
    /// 按 `AF_*` 常量查找地址族。
    pub const fn from_id(id: i32) -> Option<Self> {
        match id {
            libc::AF_INET => Some(Self::Inet4),
            libc::AF_INET6 => Some(Self::Inet6),
            libc::AF_UNIX => Some(Self::Unix),
            _ => None,
        }
    }

    /// 本族的 `AF_*` 常量。
    pub const fn id(self) -> i32 {
        match self {
            Self::Inet4 => libc::AF_INET,
            Self::Inet6 => libc::AF_INET6,
            Self::Unix => libc::AF_UNIX,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Inet4 => "inet4",
            Self::Inet6 => "inet6",
            Self::Unix => "unix",
        }
    }

    pub fn domain(self) -> Domain {
        match self {
            Self::Inet4 => Domain::IPV4,
            Self::Inet6 => Domain::IPV6,
            Self::Unix => Domain::UNIX,
        }
    }

    /// 本族是否支持给定的套接字类型。
    pub fn supports(self, ty: SocketType) -> bool {
        match self {
            Self::Inet4 | Self::Inet6 => ty == SocketType::STREAM || ty == SocketType::DGRAM,
            Self::Unix => {
                ty == SocketType::STREAM || ty == SocketType::DGRAM || ty == SocketType::SEQPACKET
            }
        }
    }

    /// 创建本族的未命名描述符。
    pub fn create_socket(self, ty: SocketType) -> Result<Socket, SocketError> {
        if !self.supports(ty) {
            return Err(SocketError::from_io(
                SocketErrorKind::Create,
                io::Error::from_raw_os_error(libc::EPROTOTYPE),
            ));
        }
        let socket = Socket::new(self.domain(), ty.into(), None)
            .map_err(|err| SocketError::from_io(SocketErrorKind::Create, err))?;
        trace!(family = self.name(), ty = ty.raw(), "socket descriptor created");
        Ok(socket)
    }

    /// 按本族布局解析原始 `sockaddr` 字节。
    pub fn parse(self, raw: &[u8]) -> Option<SocketAddress> {
        SocketAddress::parse_as(self, raw)
    }
}

impl fmt::Debug for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_type_fails_with_eprototype() {
        let err = INET4
            .create_socket(SocketType::SEQPACKET)
            .expect_err("inet4 does not offer seqpacket");
        assert_eq!(err.kind(), SocketErrorKind::Create);
        assert_eq!(err.raw_os_error(), Some(libc::EPROTOTYPE));
    }

    #[test]
    fn ids_round_trip() {
        for family in [INET4, INET6, UNIX] {
            assert_eq!(AddressFamily::from_id(family.id()), Some(family));
        }
        assert_eq!(AddressFamily::from_id(-1), None);
    }
}
