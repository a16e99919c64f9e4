#![doc = r#"
# spark-tls-session

## 设计动机（Why）
- **非阻塞握手**：把 TLS 握手拆成可重入的单步调用，调用方在自己的事件循环中反复调用
  [`SessionHandle::continue_handshake`]，遇到 `WantRead`/`WantWrite` 时挂起而不丢失状态；
- **共享状态显式化**：信任库、密码套件注册表、票据密钥与客户端会话缓存收拢到 [`TlsContext`]，
  由调用方注入 [`HandshakeEngine`]，生命周期误用（重复初始化、释放后使用）确定性报错；
- **确定性释放**：每个 [`SessionHandle`] 独占 crypto 上下文，无论握手在哪一步失败都只释放一次。

## 核心契约（What）
- [`HandshakeEngine`]：`connect`/`accept` 创建句柄（不收发字节），`*_blocking` 同步推进至终态；
- [`SessionHandle`]：握手推进、应用数据读写、校验报告与删除协议；
- [`TrustStore`]：单写多读的 CA 信任库，`init`/`set`/`get`/`free`；
- [`TicketContext`] 与 [`ClientSessionCache`]：按角色隔离的会话恢复材料；
- [`Transport`]：`read`/`write`/`bytes_available` 三原语的传输垫片。

## 实现策略（How）
- TLS 状态机由 `rustls` 提供，经 [`TlsBackend`] 抽象接入；校验由可替换的
  [`CertificateVerifier`] 完成，默认实现基于 webpki；
- 共享存储采用 `ArcSwapOption` 快照读 + `parking_lot` 互斥写；
- 启用 `runtime-tokio` 特性后，`driver` 模块基于套接字就绪通知异步驱动握手与读写。

## 风险与考量（Trade-offs）
- 写者（init/set/free）与进行中的握手并发是文档约定而非强制检查：已取得快照的握手不受影响，
  之后才触达存储的握手快速失败；
- 本层不含超时逻辑，调用方应在自己的轮询循环外侧设置超时。
"#]

mod backend;
mod cipher;
mod config;
mod context;
#[cfg(feature = "runtime-tokio")]
pub mod driver;
mod engine;
mod error;
mod resumption;
mod session;
pub mod transport;
mod trust;
mod verify;

pub use backend::{RecordState, SessionDetails, TlsBackend};
pub use cipher::{CipherSuiteInfo, CipherSuiteRegistry};
pub use config::{
    ClientOptions, NameCheck, ProtocolVersion, ServerOptions, SessionCacheSettings,
    TicketSettings, TlsSettings, TrustSource,
};
pub use context::{ServerIdentity, TlsContext, TlsContextBuilder};
pub use engine::HandshakeEngine;
pub use error::{FailureKind, HandshakeFailure, Interest, StoreKind, TlsError};
pub use resumption::{
    ClientSession, ClientSessionCache, TicketBlob, TicketContext, UnixClock, system_clock,
};
pub use session::{HandshakeState, HandshakeStats, HandshakeStatus, HandshakeStep, Role, SessionHandle};
pub use transport::{MemoryTransport, Transport, TransportError, duplex};
pub use trust::{Fingerprint, TrustAnchors, TrustStore};
pub use verify::{
    CertificateVerifier, PeerChain, RejectReason, VerificationReport, Verdict, WebPkiVerifier,
};
