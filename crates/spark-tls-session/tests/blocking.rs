//! 阻塞式入口在真实 TCP 连接上的行为。

mod support;

use std::{
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

use anyhow::Result;
use spark_tls_session::{ClientOptions, HandshakeEngine, ProtocolVersion, ServerOptions};
use support::{TestPki, trusting};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

fn configure(stream: &TcpStream) -> Result<()> {
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.set_nodelay(true)?;
    Ok(())
}

fn exchange(version: ProtocolVersion) -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;
    let engine = HandshakeEngine::new(context);

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server_engine = engine.clone();
    let server = thread::spawn(move || -> Result<Vec<u8>> {
        let (stream, _) = listener.accept()?;
        configure(&stream)?;
        let mut handle = server_engine.accept_blocking(&identity, &ServerOptions::default(), stream)?;
        let mut buf = [0u8; 64];
        let n = handle.read(&mut buf)?;
        handle.write(b"pong")?;
        handle.flush()?;
        handle.delete()?;
        Ok(buf[..n].to_vec())
    });

    let stream = TcpStream::connect(addr)?;
    configure(&stream)?;
    let options = ClientOptions::default().with_versions([version]);
    let mut client = engine.connect_blocking("localhost", &options, stream)?;
    assert!(client.is_established());
    assert_eq!(client.details()?.protocol, Some(version));

    client.write(b"ping")?;
    client.flush()?;
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf)?;
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(client.read(&mut buf)?, 0, "服务端删除句柄时发送 close_notify");

    let received = server.join().expect("server thread")?;
    assert_eq!(received, b"ping");
    Ok(())
}

#[test]
fn blocking_tls13_exchange() -> Result<()> {
    exchange(ProtocolVersion::Tls13)
}

#[test]
fn blocking_tls12_exchange() -> Result<()> {
    exchange(ProtocolVersion::Tls12)
}
