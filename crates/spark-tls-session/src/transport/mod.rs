//! 传输 I/O 垫片。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手引擎只依赖 `read`/`write`/`bytes_available` 三个原语，具体套接字实现可替换；
//! - “暂不可用”被统一翻译为 [`TransportError::WouldBlock`]，引擎据此返回 WantRead/WantWrite。
//!
//! ## 契约（What）
//! - `read` 返回 `Ok(0)` 表示对端已关闭；
//! - 非阻塞传输在无数据或缓冲区已满时必须返回 `WouldBlock`，不得阻塞；
//! - `bytes_available` 为尽力估计，返回 0 不代表连接已关闭。

mod memory;
#[cfg(feature = "runtime-tokio")]
mod tokio;

use std::{
    io::{self, Read, Write},
    net::TcpStream,
};

use thiserror::Error;

pub use memory::{MemoryTransport, duplex};

/// 传输层错误。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("传输暂不可用")]
    WouldBlock,
    #[error("传输 I/O 失败: {0}")]
    Io(io::Error),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => TransportError::WouldBlock,
            _ => TransportError::Io(error),
        }
    }
}

impl From<TransportError> for io::Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::WouldBlock => io::ErrorKind::WouldBlock.into(),
            TransportError::Io(error) => error,
        }
    }
}

/// 面向握手引擎的字节流传输。
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// 当前无需等待即可读取的字节数。
    fn bytes_available(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        (**self).write(buf)
    }

    fn bytes_available(&self) -> usize {
        (**self).bytes_available()
    }
}

/// 探测可读字节时使用的窥视窗口。
const PEEK_WINDOW: usize = 16 * 1024;

/// 标准库 TCP 流。阻塞模式下 `read` 与 `bytes_available` 都可能阻塞，
/// 非阻塞模式（`set_nonblocking(true)`）下遵守 `WouldBlock` 契约。
impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Read::read(self, buf).map_err(TransportError::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        Write::write(self, buf).map_err(TransportError::from)
    }

    fn bytes_available(&self) -> usize {
        let mut window = [0u8; PEEK_WINDOW];
        self.peek(&mut window).unwrap_or(0)
    }
}

/// 握手期间的 I/O 计数。
///
/// 往返次数按“发出需要应答的记录后首次收到数据”计。发送流按 TLS 记录头切分，
/// 只含 ChangeCipherSpec 的发送不等待应答，不开启新的往返；
/// 因此 TLS 1.3 在对端首轮数据尚未读完时补发的兼容 CCS 不会虚增计数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct IoCounters {
    pub(crate) bytes_read: u64,
    pub(crate) bytes_written: u64,
    pub(crate) round_trips: u32,
    awaiting_reply: bool,
    outbound: RecordFramer,
}

/// TLS 记录头：内容类型 1 字节、版本 2 字节、长度 2 字节。
const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_CHANGE_CIPHER_SPEC: u8 = 20;

/// 跟踪发送字节流中的记录边界。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct RecordFramer {
    header: [u8; RECORD_HEADER_LEN],
    header_len: usize,
    body_remaining: usize,
}

impl RecordFramer {
    /// 消费一段发送字节，返回其中是否出现了需要应答的记录。
    fn feed(&mut self, mut bytes: &[u8]) -> bool {
        let mut expects_reply = false;
        while !bytes.is_empty() {
            if self.body_remaining > 0 {
                let take = self.body_remaining.min(bytes.len());
                self.body_remaining -= take;
                bytes = &bytes[take..];
                continue;
            }
            let take = (RECORD_HEADER_LEN - self.header_len).min(bytes.len());
            self.header[self.header_len..self.header_len + take].copy_from_slice(&bytes[..take]);
            self.header_len += take;
            bytes = &bytes[take..];
            if self.header_len == RECORD_HEADER_LEN {
                self.header_len = 0;
                self.body_remaining = usize::from(u16::from_be_bytes([self.header[3], self.header[4]]));
                if self.header[0] != CONTENT_TYPE_CHANGE_CIPHER_SPEC {
                    expects_reply = true;
                }
            }
        }
        expects_reply
    }
}

impl IoCounters {
    fn record_read(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.bytes_read += n as u64;
        if self.awaiting_reply {
            self.round_trips += 1;
            self.awaiting_reply = false;
        }
    }

    fn record_write(&mut self, written: &[u8]) {
        if written.is_empty() {
            return;
        }
        self.bytes_written += written.len() as u64;
        if self.outbound.feed(written) {
            self.awaiting_reply = true;
        }
    }
}

/// 把 [`Transport`] 适配为 rustls 需要的 `io::Read`/`io::Write`，并记录计数。
pub(crate) struct IoShim<'a, T: ?Sized> {
    transport: &'a mut T,
    counters: &'a mut IoCounters,
}

impl<'a, T: Transport + ?Sized> IoShim<'a, T> {
    pub(crate) fn new(transport: &'a mut T, counters: &'a mut IoCounters) -> Self {
        Self {
            transport,
            counters,
        }
    }
}

impl<T: Transport + ?Sized> Read for IoShim<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.transport.read(buf)?;
        self.counters.record_read(n);
        Ok(n)
    }
}

impl<T: Transport + ?Sized> Write for IoShim<'_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.transport.write(buf)?;
        self.counters.record_write(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 构造一条指定内容类型与长度的记录。
    fn record(content_type: u8, len: u16) -> Vec<u8> {
        let mut bytes = vec![content_type, 0x03, 0x03];
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.resize(RECORD_HEADER_LEN + usize::from(len), 0xAB);
        bytes
    }

    #[test]
    fn round_trip_counts_reply_after_send() {
        let mut counters = IoCounters::default();
        counters.record_read(10);
        assert_eq!(counters.round_trips, 0);
        let hello = record(22, 6);
        counters.record_write(&hello[..5]);
        counters.record_write(&hello[5..]);
        counters.record_read(3);
        counters.record_read(3);
        assert_eq!(counters.round_trips, 1);
        counters.record_write(&record(23, 1));
        counters.record_read(0);
        assert_eq!(counters.round_trips, 1);
        counters.record_read(1);
        assert_eq!(counters.round_trips, 2);
        assert_eq!(counters.bytes_read, 17);
        assert_eq!(counters.bytes_written, 17);
    }

    #[test]
    fn change_cipher_spec_alone_awaits_nothing() {
        let mut counters = IoCounters::default();
        counters.record_write(&record(22, 40));
        counters.record_read(1);
        assert_eq!(counters.round_trips, 1);

        // 逐字节发送兼容 CCS，期间继续读到对端同一轮的剩余数据。
        for byte in record(CONTENT_TYPE_CHANGE_CIPHER_SPEC, 1) {
            counters.record_write(&[byte]);
            counters.record_read(1);
        }
        assert_eq!(counters.round_trips, 1);

        let mut flight = record(CONTENT_TYPE_CHANGE_CIPHER_SPEC, 1);
        flight.extend(record(22, 12));
        counters.record_write(&flight);
        counters.record_read(5);
        assert_eq!(counters.round_trips, 2);
    }

    #[test]
    fn shim_translates_would_block() {
        let (mut left, _right) = duplex(4);
        let mut counters = IoCounters::default();
        let mut shim = IoShim::new(&mut left, &mut counters);
        let mut buf = [0u8; 8];
        let error = shim.read(&mut buf).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(shim.write(b"abcdef").expect("partial write"), 4);
        assert_eq!(
            shim.write(b"gh").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }
}
