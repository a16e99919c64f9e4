use std::{collections::VecDeque, io, sync::Arc};

use parking_lot::Mutex;

use super::{Transport, TransportError};

/// 单向字节通道。
#[derive(Debug)]
struct Lane {
    buffer: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
}

impl Lane {
    fn shared(capacity: usize) -> Arc<Mutex<Lane>> {
        Arc::new(Mutex::new(Lane {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            writer_closed: false,
            reader_closed: false,
        }))
    }
}

/// 进程内的非阻塞双工管道端点。
///
/// 缓冲区为空时读返回 `WouldBlock`，已满时写返回 `WouldBlock`；
/// 对端被丢弃后读到 EOF（`Ok(0)`），写返回 `BrokenPipe`。
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: Arc<Mutex<Lane>>,
    outbound: Arc<Mutex<Lane>>,
    read_limit: usize,
}

/// 创建一对相连的端点，每个方向最多缓存 `capacity` 字节。
pub fn duplex(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let capacity = capacity.max(1);
    let forward = Lane::shared(capacity);
    let backward = Lane::shared(capacity);
    (
        MemoryTransport {
            inbound: backward.clone(),
            outbound: forward.clone(),
            read_limit: usize::MAX,
        },
        MemoryTransport {
            inbound: forward,
            outbound: backward,
            read_limit: usize::MAX,
        },
    )
}

impl MemoryTransport {
    /// 限制单次 `read` 返回的最大字节数，用于模拟碎片化到达。
    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit.max(1);
        self
    }

    /// 对端尚未读取的已发送字节数。
    pub fn pending_outbound(&self) -> usize {
        self.outbound.lock().buffer.len()
    }

    /// 关闭写方向；对端读尽缓冲后得到 EOF。
    pub fn shutdown_write(&mut self) {
        self.outbound.lock().writer_closed = true;
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut lane = self.inbound.lock();
        if lane.buffer.is_empty() {
            return if lane.writer_closed {
                Ok(0)
            } else {
                Err(TransportError::WouldBlock)
            };
        }
        let n = lane.buffer.len().min(buf.len()).min(self.read_limit);
        for (slot, byte) in buf.iter_mut().zip(lane.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        let mut lane = self.outbound.lock();
        if lane.reader_closed {
            return Err(TransportError::Io(io::ErrorKind::BrokenPipe.into()));
        }
        let room = lane.capacity - lane.buffer.len();
        if room == 0 {
            return Err(TransportError::WouldBlock);
        }
        let n = room.min(buf.len());
        lane.buffer.extend(&buf[..n]);
        Ok(n)
    }

    fn bytes_available(&self) -> usize {
        self.inbound.lock().buffer.len()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.inbound.lock().reader_closed = true;
        self.outbound.lock().writer_closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_flow_both_ways() {
        let (mut left, mut right) = duplex(16);
        assert_eq!(left.write(b"ping").expect("write"), 4);
        assert_eq!(right.bytes_available(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(right.read(&mut buf).expect("read"), 4);
        assert_eq!(&buf[..4], b"ping");
        right.write(b"pong").expect("write back");
        assert_eq!(left.read(&mut buf).expect("read back"), 4);
        assert_eq!(&buf[..4], b"pong");
    }

    #[test]
    fn read_limit_fragments_delivery() {
        let (mut left, right) = duplex(16);
        let mut right = right.with_read_limit(3);
        left.write(b"abcdefg").expect("write");
        let mut buf = [0u8; 16];
        assert_eq!(right.read(&mut buf).expect("first"), 3);
        assert_eq!(right.read(&mut buf).expect("second"), 3);
        assert_eq!(right.read(&mut buf).expect("third"), 1);
        assert!(matches!(
            right.read(&mut buf),
            Err(TransportError::WouldBlock)
        ));
    }

    #[test]
    fn dropping_peer_closes_lanes() {
        let (mut left, right) = duplex(16);
        left.write(b"tail").expect("write");
        drop(right);
        assert!(matches!(left.write(b"x"), Err(TransportError::Io(_))));
        let mut buf = [0u8; 4];
        assert_eq!(left.read(&mut buf).expect("eof"), 0);
    }

    #[test]
    fn shutdown_write_delivers_eof_after_drain() {
        let (mut left, mut right) = duplex(16);
        left.write(b"bye").expect("write");
        left.shutdown_write();
        let mut buf = [0u8; 8];
        assert_eq!(right.read(&mut buf).expect("drain"), 3);
        assert_eq!(right.read(&mut buf).expect("eof"), 0);
        assert_eq!(left.pending_outbound(), 0);
    }
}
