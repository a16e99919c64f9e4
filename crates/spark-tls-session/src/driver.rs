//! 基于 Tokio 就绪通知的异步驱动器。
//!
//! 握手与应用数据仍由同步的 `continue_handshake`/`read`/`write` 完成，
//! 驱动器只在收到 `WantRead`/`WantWrite`（或 `WouldBlock`）时等待套接字就绪。

use tokio::net::TcpStream;

use crate::{
    error::{self, Interest, TlsError},
    session::{HandshakeStatus, SessionHandle},
};

/// 异步推进握手直至终态。
pub async fn drive_handshake(handle: &mut SessionHandle<TcpStream>) -> Result<(), TlsError> {
    loop {
        match handle.continue_handshake()? {
            HandshakeStatus::Established => return Ok(()),
            HandshakeStatus::WantRead => wait(handle.transport()?, Interest::Read).await?,
            HandshakeStatus::WantWrite => wait(handle.transport()?, Interest::Write).await?,
        }
    }
}

/// 异步读取应用数据。
pub async fn read(handle: &mut SessionHandle<TcpStream>, buf: &mut [u8]) -> Result<usize, TlsError> {
    loop {
        match handle.read(buf) {
            Err(TlsError::WouldBlock(interest)) => wait(handle.transport()?, interest).await?,
            other => return other,
        }
    }
}

/// 异步写入全部应用数据并刷新。
pub async fn write_all(handle: &mut SessionHandle<TcpStream>, mut data: &[u8]) -> Result<(), TlsError> {
    while !data.is_empty() {
        match handle.write(data) {
            Ok(n) => data = &data[n..],
            Err(TlsError::WouldBlock(interest)) => wait(handle.transport()?, interest).await?,
            Err(error) => return Err(error),
        }
    }
    loop {
        match handle.flush() {
            Err(TlsError::WouldBlock(interest)) => wait(handle.transport()?, interest).await?,
            other => return other,
        }
    }
}

async fn wait(stream: &TcpStream, interest: Interest) -> Result<(), TlsError> {
    let ready = match interest {
        Interest::Read => stream.readable().await,
        Interest::Write => stream.writable().await,
    };
    ready.map_err(|e| error::from_io(error::HANDSHAKE, e))
}
