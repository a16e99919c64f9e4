use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use rustls_pki_types::CertificateDer;
use tracing::{debug, warn};

use crate::{
    backend::{RecordState, SessionDetails, TlsBackend},
    error::{self, FailureKind, Interest, OperationKind, TlsError},
    resumption::ClientSessionCache,
    transport::{IoCounters, IoShim, Transport},
    verify::VerificationReport,
};

const HANDLE: &str = "session handle";

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_handle_id() -> u64 {
    NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// 连接角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// 握手状态；只由握手引擎推进。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Uninitialized,
    InProgress(HandshakeStep),
    Established,
    Failed(TlsError),
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Established | HandshakeState::Failed(_))
    }
}

/// 握手暂停时所处的步骤。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStep {
    /// 仍有待发送的握手记录。
    Flushing,
    /// 等待对端的下一组握手记录。
    AwaitingPeer,
}

/// 单次推进握手的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    Established,
    WantRead,
    WantWrite,
}

/// 握手统计。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeStats {
    pub continue_calls: u32,
    /// 客户端视角下的协议往返次数。
    pub round_trips: u32,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

pub(crate) struct Live<T> {
    pub(crate) backend: Box<dyn TlsBackend>,
    pub(crate) transport: T,
    pub(crate) records: RecordState,
}

/// 单个 TLS 连接的会话句柄。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 独占持有 crypto 上下文与传输，保证二者随句柄一起、且只释放一次；
/// - 握手状态保存在句柄内，`continue_handshake` 可以跨多次调用接续推进。
///
/// ## 契约（What）
/// - `delete` 之后任何返回 `Result` 的操作（包括再次 `delete`）都返回
///   [`TlsError::UseAfterFree`]；`id`/`role`/`state`/`stats` 等元数据访问器不会失败；
/// - 未调用 `delete` 而直接丢弃句柄，执行与 `delete` 相同的释放流程；
/// - 客户端句柄写入的会话缓存槽若未被 `ClientSessionCache::get` 取走，随句柄一起失效；
/// - 应用数据读写只在握手建立后可用，`WouldBlock` 以 [`TlsError::WouldBlock`] 返回。
pub struct SessionHandle<T: Transport> {
    pub(crate) id: u64,
    pub(crate) role: Role,
    pub(crate) identity: Option<String>,
    pub(crate) state: HandshakeState,
    pub(crate) live: Option<Live<T>>,
    pub(crate) counters: IoCounters,
    pub(crate) continue_calls: u32,
    session_cache: Option<Arc<ClientSessionCache>>,
}

impl<T: Transport> SessionHandle<T> {
    pub(crate) fn new(
        id: u64,
        role: Role,
        identity: Option<String>,
        backend: Box<dyn TlsBackend>,
        transport: T,
    ) -> Self {
        debug!(handle = id, role = %role, identity = identity.as_deref(), "tls session created");
        Self {
            id,
            role,
            identity,
            state: HandshakeState::Uninitialized,
            live: Some(Live {
                backend,
                transport,
                records: RecordState::default(),
            }),
            counters: IoCounters::default(),
            continue_calls: 0,
            session_cache: None,
        }
    }

    /// 记录该句柄写入的客户端会话缓存，删除时释放其名下的槽位。
    pub(crate) fn with_session_cache(mut self, cache: Arc<ClientSessionCache>) -> Self {
        self.session_cache = Some(cache);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// 客户端连接的服务器身份；服务端句柄为 `None`。
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established && self.live.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.live.is_none()
    }

    pub fn stats(&self) -> HandshakeStats {
        HandshakeStats {
            continue_calls: self.continue_calls,
            round_trips: self.counters.round_trips,
            bytes_read: self.counters.bytes_read,
            bytes_written: self.counters.bytes_written,
        }
    }

    /// 协商结果（协议、套件、ALPN、是否恢复）。
    pub fn details(&self) -> Result<SessionDetails, TlsError> {
        Ok(self.live()?.backend.details())
    }

    /// 证书校验报告；服务端句柄返回空报告。
    pub fn verification(&self) -> Result<VerificationReport, TlsError> {
        Ok(self.live()?.backend.verification())
    }

    pub fn peer_certificates(&self) -> Result<Option<Vec<CertificateDer<'static>>>, TlsError> {
        Ok(self.live()?.backend.peer_certificates())
    }

    pub fn transport(&self) -> Result<&T, TlsError> {
        Ok(&self.live()?.transport)
    }

    pub fn transport_mut(&mut self) -> Result<&mut T, TlsError> {
        Ok(&mut self.live_mut()?.transport)
    }

    /// 已解密、可立即读取的应用数据字节数。
    pub fn bytes_available(&self) -> Result<usize, TlsError> {
        Ok(self.live()?.records.plaintext_pending)
    }

    /// 读取应用数据；`Ok(0)` 表示对端已发送 close_notify。
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, TlsError> {
        self.ensure_established()?;
        let Self { live, counters, .. } = self;
        let live = live.as_mut().ok_or(TlsError::UseAfterFree(HANDLE))?;
        loop {
            match live.backend.read_plaintext(buf) {
                Ok(n) => {
                    live.records.plaintext_pending = live.records.plaintext_pending.saturating_sub(n);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(error::from_io(error::READ, e)),
            }
            let mut shim = IoShim::new(&mut live.transport, &mut *counters);
            match live.backend.read_tls(&mut shim) {
                Ok(0) => {
                    live.records = live.backend.process_records()?;
                    return match live.backend.read_plaintext(buf) {
                        Ok(n) => Ok(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            Err(error::connection_closed(error::READ))
                        }
                        Err(e) => Err(error::from_io(error::READ, e)),
                    };
                }
                Ok(_) => {
                    live.records = live.backend.process_records()?;
                    // 握手后消息（如 KeyUpdate 应答）尽力发送，阻塞留给下一次调用。
                    flush_records(live, &mut *counters, error::READ)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TlsError::WouldBlock(Interest::Read));
                }
                Err(e) => return Err(error::from_io(error::READ, e)),
            }
        }
    }

    /// 写入应用数据，返回被接受的字节数；密文尽力发送，剩余部分由 [`Self::flush`] 继续。
    pub fn write(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        self.ensure_established()?;
        let Self { live, counters, .. } = self;
        let live = live.as_mut().ok_or(TlsError::UseAfterFree(HANDLE))?;
        let accepted = live
            .backend
            .write_plaintext(data)
            .map_err(|e| error::from_io(error::WRITE, e))?;
        let flushed = flush_records(live, &mut *counters, error::WRITE)?;
        if accepted == 0 && !data.is_empty() && flushed == Flush::Blocked {
            return Err(TlsError::WouldBlock(Interest::Write));
        }
        Ok(accepted)
    }

    /// 发送所有排队的密文。
    pub fn flush(&mut self) -> Result<(), TlsError> {
        let Self { live, counters, .. } = self;
        let live = live.as_mut().ok_or(TlsError::UseAfterFree(HANDLE))?;
        match flush_records(live, counters, error::FLUSH)? {
            Flush::Drained => Ok(()),
            Flush::Blocked => Err(TlsError::WouldBlock(Interest::Write)),
        }
    }

    /// 释放 crypto 上下文、缓冲区与传输。已建立的连接会尽力发送 close_notify。
    pub fn delete(&mut self) -> Result<(), TlsError> {
        if self.release() {
            Ok(())
        } else {
            warn!(handle = self.id, code = "spark.tls.use_after_free", "session handle deleted twice");
            Err(TlsError::UseAfterFree(HANDLE))
        }
    }

    fn release(&mut self) -> bool {
        let Some(mut live) = self.live.take() else {
            return false;
        };
        if self.state == HandshakeState::Established {
            live.backend.close();
            if let Err(error) = flush_records(&mut live, &mut self.counters, error::FLUSH) {
                debug!(handle = self.id, code = error.code(), "close_notify not delivered");
            }
        }
        drop(live);
        if let (Some(cache), Some(identity)) = (self.session_cache.take(), self.identity.as_deref()) {
            cache.release_owner(identity, self.id);
        }
        debug!(handle = self.id, role = %self.role, state = ?self.state, "tls session released");
        true
    }

    pub(crate) fn live(&self) -> Result<&Live<T>, TlsError> {
        self.live.as_ref().ok_or(TlsError::UseAfterFree(HANDLE))
    }

    pub(crate) fn live_mut(&mut self) -> Result<&mut Live<T>, TlsError> {
        self.live.as_mut().ok_or(TlsError::UseAfterFree(HANDLE))
    }

    fn ensure_established(&self) -> Result<(), TlsError> {
        self.live()?;
        match &self.state {
            HandshakeState::Established => Ok(()),
            HandshakeState::Failed(error) => Err(error.clone()),
            _ => Err(error::failure(
                FailureKind::Incomplete,
                "application data requires an established session",
            )),
        }
    }
}

impl<T: Transport> Drop for SessionHandle<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Transport> fmt::Debug for SessionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("deleted", &self.live.is_none())
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flush {
    Drained,
    Blocked,
}

/// 把排队的密文写入传输，直到清空或传输阻塞。
pub(crate) fn flush_records<T: Transport>(
    live: &mut Live<T>,
    counters: &mut IoCounters,
    kind: OperationKind,
) -> Result<Flush, TlsError> {
    while live.backend.wants_write() {
        let mut shim = IoShim::new(&mut live.transport, &mut *counters);
        match live.backend.write_tls(&mut shim) {
            Ok(0) => return Err(error::connection_closed(kind)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
            Err(e) => return Err(error::from_io(kind, e)),
        }
    }
    Ok(Flush::Drained)
}
