use std::{
    io::{self, Read, Write},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use rustls::{ClientConnection, Connection, HandshakeKind, ServerConnection};
use rustls_pki_types::CertificateDer;

use crate::{
    cipher::CipherSuiteInfo,
    config::ProtocolVersion,
    error::{self, StoreKind, TlsError},
    verify::{VerificationLog, VerificationReport, VerifyOutcome, Verdict},
};

/// 记录层处理后的状态。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordState {
    /// 已解密、等待应用读取的字节数。
    pub plaintext_pending: usize,
    pub peer_closed: bool,
}

/// 已建立（或进行中）连接的协商结果。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionDetails {
    pub protocol: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuiteInfo>,
    pub alpn: Option<Vec<u8>>,
    /// 是否通过会话恢复完成握手。
    pub resumed: bool,
    /// 服务端本连接签发的票据数。
    pub tickets_issued: usize,
}

/// TLS 引擎抽象：握手引擎只通过这组接口驱动底层实现。
///
/// # 契约（What）
/// - `read_tls`/`write_tls` 只搬运密文，不解析；
/// - `process_records` 处理已读入的密文，推进握手或解密应用数据；错误即终态；
/// - 释放通过 `Drop` 完成，`close` 只负责排队 close_notify。
pub trait TlsBackend: Send + Sync {
    fn is_handshaking(&self) -> bool;

    fn wants_read(&self) -> bool;

    fn wants_write(&self) -> bool;

    fn read_tls(&mut self, source: &mut dyn Read) -> io::Result<usize>;

    fn write_tls(&mut self, sink: &mut dyn Write) -> io::Result<usize>;

    fn process_records(&mut self) -> Result<RecordState, TlsError>;

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize>;

    fn verification(&self) -> VerificationReport;

    fn details(&self) -> SessionDetails;

    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>>;

    fn close(&mut self);
}

/// 基于 rustls 的后端实现。
pub(crate) struct RustlsBackend {
    conn: Connection,
    verification: Option<Arc<VerificationLog>>,
    tickets_issued: Option<Arc<AtomicUsize>>,
}

impl RustlsBackend {
    pub(crate) fn client(conn: ClientConnection, verification: Arc<VerificationLog>) -> Self {
        Self {
            conn: Connection::Client(conn),
            verification: Some(verification),
            tickets_issued: None,
        }
    }

    pub(crate) fn server(conn: ServerConnection, tickets_issued: Arc<AtomicUsize>) -> Self {
        Self {
            conn: Connection::Server(conn),
            verification: None,
            tickets_issued: Some(tickets_issued),
        }
    }

    /// 校验器记录的结论比 rustls 的错误文本更精确，优先使用。
    fn classify(&self, error: &rustls::Error) -> TlsError {
        if let Some(log) = &self.verification {
            match log.outcome() {
                Some(VerifyOutcome::StoreUnavailable) => {
                    return TlsError::StoreNotInitialized(StoreKind::TrustStore);
                }
                Some(VerifyOutcome::Verdict(Verdict::Reject(reason))) => {
                    return TlsError::VerificationFailed(reason);
                }
                _ => {}
            }
        }
        error::from_rustls(error)
    }
}

impl TlsBackend for RustlsBackend {
    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn read_tls(&mut self, source: &mut dyn Read) -> io::Result<usize> {
        self.conn.read_tls(source)
    }

    fn write_tls(&mut self, sink: &mut dyn Write) -> io::Result<usize> {
        self.conn.write_tls(sink)
    }

    fn process_records(&mut self) -> Result<RecordState, TlsError> {
        match self.conn.process_new_packets() {
            Ok(state) => Ok(RecordState {
                plaintext_pending: state.plaintext_bytes_to_read(),
                peer_closed: state.peer_has_closed(),
            }),
            Err(error) => Err(self.classify(&error)),
        }
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.reader().read(buf)
    }

    fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        self.conn.writer().write(data)
    }

    fn verification(&self) -> VerificationReport {
        self.verification
            .as_ref()
            .map(|log| log.report())
            .unwrap_or_default()
    }

    fn details(&self) -> SessionDetails {
        SessionDetails {
            protocol: self
                .conn
                .protocol_version()
                .and_then(ProtocolVersion::from_rustls),
            cipher_suite: self
                .conn
                .negotiated_cipher_suite()
                .map(|suite| CipherSuiteInfo::from(&suite)),
            alpn: self.conn.alpn_protocol().map(<[u8]>::to_vec),
            resumed: self.conn.handshake_kind() == Some(HandshakeKind::Resumed),
            tickets_issued: self
                .tickets_issued
                .as_ref()
                .map(|issued| issued.load(Ordering::Relaxed))
                .unwrap_or(0),
        }
    }

    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.conn.peer_certificates().map(<[CertificateDer<'static>]>::to_vec)
    }

    fn close(&mut self) {
        self.conn.send_close_notify();
    }
}
