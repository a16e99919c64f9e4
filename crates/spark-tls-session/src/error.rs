use std::{borrow::Cow, fmt, io};

use rustls::{AlertDescription, Error as RustlsError};
use thiserror::Error;

use crate::verify::RejectReason;

/// TLS 会话编排层的统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把 `rustls`、传输层与生命周期误用三类错误收敛为一个可克隆的枚举，使握手进入终态后
///   `continue_handshake` 能够重复返回“同一个”错误；
/// - 为每个变体提供稳定错误码（[`TlsError::code`]），便于日志聚合与自动化处置。
///
/// ## 契约（What）
/// - `WouldBlock` 不是失败，而是调度信号，仅出现在应用数据读写路径；
/// - `StoreNotInitialized`/`AlreadyInitialized`/`UseAfterFree` 为生命周期误用，必须确定性返回；
/// - `VerificationFailed` 只终止当前握手，不影响共享信任库。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TlsError {
    /// 需要等待底层传输可读或可写后重试。
    #[error("传输暂不可用，等待{0}就绪")]
    WouldBlock(Interest),
    /// 握手或记录层失败，同一句柄不可重试。
    #[error("TLS 握手失败: {0}")]
    HandshakeFailed(HandshakeFailure),
    /// 对端证书链被校验器拒绝。
    #[error("证书校验失败: {0}")]
    VerificationFailed(RejectReason),
    /// 缓冲区、随机数或时间源等资源不可用。
    #[error("资源耗尽: {0}")]
    ResourceExhausted(Cow<'static, str>),
    /// 共享存储尚未初始化，或已经释放。
    #[error("{0}尚未初始化或已释放")]
    StoreNotInitialized(StoreKind),
    /// 共享存储重复初始化。
    #[error("{0}已初始化，重复初始化前必须先释放")]
    AlreadyInitialized(StoreKind),
    /// 对已删除的对象继续操作。
    #[error("{0}已删除，禁止继续使用")]
    UseAfterFree(&'static str),
    /// 选项或配置文件不合法。
    #[error("配置无效: {0}")]
    InvalidConfiguration(Cow<'static, str>),
    /// 证书或私钥材料无法解析。
    #[error("证书材料无效: {0}")]
    InvalidMaterial(Cow<'static, str>),
}

impl TlsError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            TlsError::WouldBlock(_) => "spark.tls.would_block",
            TlsError::HandshakeFailed(_) => "spark.tls.handshake_failed",
            TlsError::VerificationFailed(_) => "spark.tls.verification_failed",
            TlsError::ResourceExhausted(_) => "spark.tls.resource_exhausted",
            TlsError::StoreNotInitialized(_) => "spark.tls.store_not_initialized",
            TlsError::AlreadyInitialized(_) => "spark.tls.already_initialized",
            TlsError::UseAfterFree(_) => "spark.tls.use_after_free",
            TlsError::InvalidConfiguration(_) => "spark.tls.invalid_configuration",
            TlsError::InvalidMaterial(_) => "spark.tls.invalid_material",
        }
    }

    /// 是否为调度信号而非失败。
    pub fn is_would_block(&self) -> bool {
        matches!(self, TlsError::WouldBlock(_))
    }

    /// 是否属于生命周期误用（重复初始化、释放后使用）。
    pub fn is_lifecycle_misuse(&self) -> bool {
        matches!(
            self,
            TlsError::StoreNotInitialized(_)
                | TlsError::AlreadyInitialized(_)
                | TlsError::UseAfterFree(_)
        )
    }

    /// 握手失败时返回失败分类。
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            TlsError::HandshakeFailed(failure) => Some(failure.kind),
            _ => None,
        }
    }
}

/// 等待方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interest {
    Read,
    Write,
}

impl fmt::Display for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interest::Read => f.write_str("可读"),
            Interest::Write => f.write_str("可写"),
        }
    }
}

/// 具备显式 init/free 生命周期的共享存储。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreKind {
    TrustStore,
    TicketContext,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::TrustStore => f.write_str("信任库"),
            StoreKind::TicketContext => f.write_str("会话票据上下文"),
        }
    }
}

/// 握手失败的分类。
///
/// 分类沿用传输层的约定：完整性违规、身份认证失败、能力不兼容、对端告警、连接关闭、
/// 传输故障与内部错误。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Integrity,
    Authentication,
    Incompatible,
    PeerAlert,
    ConnectionClosed,
    Transport,
    Incomplete,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Integrity => "integrity",
            FailureKind::Authentication => "authentication",
            FailureKind::Incompatible => "incompatible",
            FailureKind::PeerAlert => "peer_alert",
            FailureKind::ConnectionClosed => "connection_closed",
            FailureKind::Transport => "transport",
            FailureKind::Incomplete => "incomplete",
            FailureKind::Internal => "internal",
        };
        f.write_str(label)
    }
}

/// 握手失败详情：分类 + 人类可读描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeFailure {
    pub kind: FailureKind,
    pub detail: Cow<'static, str>,
}

impl HandshakeFailure {
    pub fn new(kind: FailureKind, detail: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}

/// 描述一次 TLS 操作的默认文案，用于拼接错误详情。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub message: &'static str,
}

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    message: "tls handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    message: "tls read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    message: "tls write",
};

pub(crate) const FLUSH: OperationKind = OperationKind {
    message: "tls flush",
};

pub(crate) fn failure(kind: FailureKind, detail: impl Into<Cow<'static, str>>) -> TlsError {
    TlsError::HandshakeFailed(HandshakeFailure::new(kind, detail))
}

/// 对端在握手完成前关闭了连接。
pub(crate) fn connection_closed(kind: OperationKind) -> TlsError {
    failure(
        FailureKind::ConnectionClosed,
        format!("{}: peer closed the transport", kind.message),
    )
}

/// 将传输层 `io::Error` 映射为 [`TlsError`]。
///
/// 若错误内嵌 `rustls::Error`，优先按 TLS 语义分类。
pub(crate) fn from_io(kind: OperationKind, error: io::Error) -> TlsError {
    if let Some(source) = error.get_ref()
        && let Some(rustls_error) = source.downcast_ref::<RustlsError>()
    {
        return from_rustls(rustls_error);
    }
    let detail = format!("{}: {}", kind.message, error);
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => TlsError::WouldBlock(Interest::Read),
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => failure(FailureKind::ConnectionClosed, detail),
        ErrorKind::WriteZero | ErrorKind::OutOfMemory => TlsError::ResourceExhausted(detail.into()),
        ErrorKind::InvalidData => failure(FailureKind::Integrity, detail),
        _ => failure(FailureKind::Transport, detail),
    }
}

/// 将 `rustls::Error` 映射为 [`TlsError`]。
pub(crate) fn from_rustls(error: &RustlsError) -> TlsError {
    use RustlsError::*;
    let detail = || Cow::Owned(error.to_string());
    match error {
        InvalidCertificate(cert_error) => {
            TlsError::VerificationFailed(RejectReason::from_certificate_error(cert_error))
        }
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidEncryptedClientHello(_)
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => failure(FailureKind::Integrity, detail()),
        NoCertificatesPresented | InvalidCertRevocationList(_) | UnsupportedNameType => {
            failure(FailureKind::Authentication, detail())
        }
        PeerIncompatible(_) | NoApplicationProtocol => {
            failure(FailureKind::Incompatible, detail())
        }
        FailedToGetCurrentTime | FailedToGetRandomBytes => {
            TlsError::ResourceExhausted(detail())
        }
        BadMaxFragmentSize | InconsistentKeys(_) => TlsError::InvalidConfiguration(detail()),
        AlertReceived(alert) => failure(alert_kind(alert), detail()),
        HandshakeNotComplete => failure(FailureKind::Incomplete, detail()),
        _ => failure(FailureKind::Internal, detail()),
    }
}

fn alert_kind(alert: &AlertDescription) -> FailureKind {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | NoCertificate
        | CertificateUnobtainable
        | CertificateRequired
        | AccessDenied => FailureKind::Authentication,
        CloseNotify | UserCanceled => FailureKind::ConnectionClosed,
        ProtocolVersion | InsufficientSecurity | NoApplicationProtocol | UnsupportedExtension => {
            FailureKind::Incompatible
        }
        _ => FailureKind::PeerAlert,
    }
}
