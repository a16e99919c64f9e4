use ::tokio::net::TcpStream;

use super::{Transport, TransportError};

/// Tokio TCP 流：通过 `try_read`/`try_write` 实现非阻塞读写，
/// 就绪等待由 `driver` 模块负责。
impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.try_read(buf).map_err(TransportError::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        self.try_write(buf).map_err(TransportError::from)
    }

    /// Tokio 不暴露窥视接口，始终返回 0；引擎会在下一次调用时直接尝试读取。
    fn bytes_available(&self) -> usize {
        0
    }
}
