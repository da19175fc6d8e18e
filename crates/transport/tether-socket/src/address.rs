//! 不可变的套接字地址值。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 调用方需要在地址族之间以统一方式传递端点，同时能取得与内核交换的原始 `sockaddr` 字节；
//! - 路径型地址（UNIX 域）长度可变，不能假设固定大小的字节布局。
//!
//! ## 逻辑 (How)
//! - [`SocketAddress`] 以枚举区分族，每个变体持有类型化的值；
//! - 原始字节按平台 `sockaddr_*` 布局编码：族标签为本机序（BSD 系平台前置长度字节），
//!   端口与 IP 为网络序；
//! - 与 `socket2::SockAddr` 的互转走类型化路径，不依赖原始指针。
//!
//! ## 契约 (What)
//! - 地址一经构造不可修改；
//! - [`SocketAddress::parse_as`] 在族标签不符或长度不足时返回 `None`，从不读越界。

use std::{
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    path::{Path, PathBuf},
    str::FromStr,
};

use bytes::{BufMut, Bytes, BytesMut};
use socket2::{Domain, SockAddr};

use crate::family::AddressFamily;

const INET4_LEN: usize = 16;
const INET6_LEN: usize = 28;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod layout {
    use bytes::BufMut;

    pub(super) const HEADER: usize = 2;
    pub(super) const SUN_PATH: usize = 104;

    pub(super) fn put_header(buffer: &mut impl BufMut, length: usize, family: i32) {
        buffer.put_u8(u8::try_from(length).unwrap_or(u8::MAX));
        buffer.put_u8(family as u8);
    }

    pub(super) fn family_tag(raw: &[u8]) -> Option<i32> {
        raw.get(1).map(|tag| i32::from(*tag))
    }
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
mod layout {
    use bytes::BufMut;

    pub(super) const HEADER: usize = 2;
    pub(super) const SUN_PATH: usize = 108;

    pub(super) fn put_header(buffer: &mut impl BufMut, _length: usize, family: i32) {
        buffer.put_u16_ne(family as u16);
    }

    pub(super) fn family_tag(raw: &[u8]) -> Option<i32> {
        let tag = raw.get(..2)?;
        Some(i32::from(u16::from_ne_bytes([tag[0], tag[1]])))
    }
}

fn read_u16_be(raw: &[u8], at: usize) -> Option<u16> {
    let bytes = raw.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32_ne(raw: &[u8], at: usize) -> Option<u32> {
    let bytes: [u8; 4] = raw.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_ne_bytes(bytes))
}

/// IPv4 主机地址。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inet4Address(Ipv4Addr);

impl Inet4Address {
    pub const fn loopback() -> Self {
        Self(Ipv4Addr::LOCALHOST)
    }

    pub const fn any() -> Self {
        Self(Ipv4Addr::UNSPECIFIED)
    }

    /// 解析点分十进制表示。
    pub fn from_presentation(text: &str) -> Option<Self> {
        Ipv4Addr::from_str(text).ok().map(Self)
    }

    pub fn presentation(&self) -> String {
        self.0.to_string()
    }

    /// 网络序的 4 字节地址。
    pub const fn address_bytes(&self) -> [u8; 4] {
        self.0.octets()
    }

    pub const fn family(&self) -> AddressFamily {
        AddressFamily::Inet4
    }

    pub const fn ip(&self) -> Ipv4Addr {
        self.0
    }
}

impl From<Ipv4Addr> for Inet4Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self(ip)
    }
}

/// IPv6 主机地址。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inet6Address(Ipv6Addr);

impl Inet6Address {
    pub const fn loopback() -> Self {
        Self(Ipv6Addr::LOCALHOST)
    }

    pub const fn any() -> Self {
        Self(Ipv6Addr::UNSPECIFIED)
    }

    pub fn from_presentation(text: &str) -> Option<Self> {
        Ipv6Addr::from_str(text).ok().map(Self)
    }

    pub fn presentation(&self) -> String {
        self.0.to_string()
    }

    /// 网络序的 16 字节地址。
    pub const fn address_bytes(&self) -> [u8; 16] {
        self.0.octets()
    }

    pub const fn family(&self) -> AddressFamily {
        AddressFamily::Inet6
    }

    pub const fn ip(&self) -> Ipv6Addr {
        self.0
    }
}

impl From<Ipv6Addr> for Inet6Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self(ip)
    }
}

/// IPv4 端点：地址 + 端口。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inet4SocketAddress {
    address: Inet4Address,
    port: u16,
}

impl Inet4SocketAddress {
    pub const fn new(address: Inet4Address, port: u16) -> Self {
        Self { address, port }
    }

    pub const fn address(&self) -> Inet4Address {
        self.address
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

/// IPv6 端点：地址、端口、流标签与作用域。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inet6SocketAddress {
    address: Inet6Address,
    port: u16,
    flow_info: u32,
    scope_id: u32,
}

impl Inet6SocketAddress {
    pub const fn new(address: Inet6Address, port: u16) -> Self {
        Self {
            address,
            port,
            flow_info: 0,
            scope_id: 0,
        }
    }

    pub const fn with_scope(mut self, flow_info: u32, scope_id: u32) -> Self {
        self.flow_info = flow_info;
        self.scope_id = scope_id;
        self
    }

    pub const fn address(&self) -> Inet6Address {
        self.address
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn flow_info(&self) -> u32 {
        self.flow_info
    }

    pub const fn scope_id(&self) -> u32 {
        self.scope_id
    }
}

/// UNIX 域路径地址；空路径表示未命名端点（如未绑定的客户端）。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnixSocketAddress {
    path: PathBuf,
}

impl UnixSocketAddress {
    /// 以文件系统路径构造；路径含 NUL 或超出 `sun_path` 容量时返回 `None`。
    pub fn new(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let bytes = path.as_os_str().as_encoded_bytes();
        if bytes.contains(&0) || bytes.len() >= layout::SUN_PATH {
            return None;
        }
        Some(Self { path })
    }

    pub fn unnamed() -> Self {
        Self {
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_unnamed(&self) -> bool {
        self.path.as_os_str().is_empty()
    }
}

/// 任一地址族的套接字地址。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SocketAddress {
    Inet4(Inet4SocketAddress),
    Inet6(Inet6SocketAddress),
    Unix(UnixSocketAddress),
}

impl SocketAddress {
    pub fn inet4(address: Inet4Address, port: u16) -> Self {
        Self::Inet4(Inet4SocketAddress::new(address, port))
    }

    pub fn inet6(address: Inet6Address, port: u16) -> Self {
        Self::Inet6(Inet6SocketAddress::new(address, port))
    }

    pub fn unix(path: impl Into<PathBuf>) -> Option<Self> {
        UnixSocketAddress::new(path).map(Self::Unix)
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Self::Inet4(_) => AddressFamily::Inet4,
            Self::Inet6(_) => AddressFamily::Inet6,
            Self::Unix(_) => AddressFamily::Unix,
        }
    }

    /// 端口；路径型地址没有端口。
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Inet4(inet) => Some(inet.port()),
            Self::Inet6(inet) => Some(inet.port()),
            Self::Unix(_) => None,
        }
    }

    /// 原始字节形式的长度。
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Inet4(_) => INET4_LEN,
            Self::Inet6(_) => INET6_LEN,
            Self::Unix(unix) if unix.is_unnamed() => layout::HEADER,
            Self::Unix(unix) => layout::HEADER + unix.path.as_os_str().as_encoded_bytes().len() + 1,
        }
    }

    /// 平台 `sockaddr_*` 布局的原始字节。
    pub fn to_bytes(&self) -> Bytes {
        let length = self.byte_len();
        let mut buffer = BytesMut::with_capacity(length);
        layout::put_header(&mut buffer, length, self.family().id());
        match self {
            Self::Inet4(inet) => {
                buffer.put_u16(inet.port);
                buffer.put_slice(&inet.address.address_bytes());
                buffer.put_bytes(0, INET4_LEN - buffer.len());
            }
            Self::Inet6(inet) => {
                buffer.put_u16(inet.port);
                buffer.put_u32_ne(inet.flow_info);
                buffer.put_slice(&inet.address.address_bytes());
                buffer.put_u32_ne(inet.scope_id);
            }
            Self::Unix(unix) => {
                if !unix.is_unnamed() {
                    buffer.put_slice(unix.path.as_os_str().as_encoded_bytes());
                    buffer.put_u8(0);
                }
            }
        }
        buffer.freeze()
    }

    /// 按 `family` 的布局解析原始字节。
    pub fn parse_as(family: AddressFamily, raw: &[u8]) -> Option<Self> {
        if layout::family_tag(raw)? != family.id() {
            return None;
        }
        match family {
            AddressFamily::Inet4 => {
                let port = read_u16_be(raw, 2)?;
                let octets: [u8; 4] = raw.get(4..8)?.try_into().ok()?;
                Some(Self::inet4(Ipv4Addr::from(octets).into(), port))
            }
            AddressFamily::Inet6 => {
                if raw.len() < INET6_LEN {
                    return None;
                }
                let port = read_u16_be(raw, 2)?;
                let flow_info = read_u32_ne(raw, 4)?;
                let octets: [u8; 16] = raw.get(8..24)?.try_into().ok()?;
                let scope_id = read_u32_ne(raw, 24)?;
                Some(Self::Inet6(
                    Inet6SocketAddress::new(Ipv6Addr::from(octets).into(), port)
                        .with_scope(flow_info, scope_id),
                ))
            }
            AddressFamily::Unix => {
                let path = raw.get(layout::HEADER..)?;
                let end = path.iter().position(|byte| *byte == 0).unwrap_or(path.len());
                if end == 0 {
                    return Some(Self::Unix(UnixSocketAddress::unnamed()));
                }
                let text = std::str::from_utf8(&path[..end]).ok()?;
                Self::unix(text)
            }
        }
    }

    /// 转为 `socket2` 地址以交给系统调用。
    pub(crate) fn to_sock_addr(&self) -> io::Result<SockAddr> {
        match self {
            Self::Inet4(_) | Self::Inet6(_) => match self.to_std() {
                Some(std) => Ok(SockAddr::from(std)),
                None => Err(io::Error::from(io::ErrorKind::InvalidInput)),
            },
            Self::Unix(unix) => SockAddr::unix(&unix.path),
        }
    }

    /// 从内核返回的 `socket2` 地址还原；不支持的族返回 `None`。
    pub(crate) fn from_sock_addr(addr: &SockAddr) -> Option<Self> {
        if let Some(std) = addr.as_socket() {
            return Some(Self::from(std));
        }
        if addr.domain() != Domain::UNIX {
            return None;
        }
        match addr.as_pathname() {
            Some(path) => UnixSocketAddress::new(path).map(Self::Unix),
            None => Some(Self::Unix(UnixSocketAddress::unnamed())),
        }
    }

    /// 转为标准库地址；路径型地址返回 `None`。
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet4(inet) => Some(SocketAddr::V4(SocketAddrV4::new(
                inet.address.ip(),
                inet.port,
            ))),
            Self::Inet6(inet) => Some(SocketAddr::V6(SocketAddrV6::new(
                inet.address.ip(),
                inet.port,
                inet.flow_info,
                inet.scope_id,
            ))),
            Self::Unix(_) => None,
        }
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::inet4((*v4.ip()).into(), v4.port()),
            SocketAddr::V6(v6) => Self::Inet6(
                Inet6SocketAddress::new((*v6.ip()).into(), v6.port())
                    .with_scope(v6.flowinfo(), v6.scope_id()),
            ),
        }
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet4(inet) => write!(f, "{}:{}", inet.address.ip(), inet.port),
            Self::Inet6(inet) => write!(f, "[{}]:{}", inet.address.ip(), inet.port),
            Self::Unix(unix) if unix.is_unnamed() => f.write_str("unix:(unnamed)"),
            Self::Unix(unix) => write!(f, "unix:{}", unix.path.display()),
        }
    }
}
