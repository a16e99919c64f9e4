use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rustls::{crypto::aws_lc_rs::Ticketer, server::ProducesTickets};
use tracing::{debug, info, warn};

use super::{UnixClock, system_clock};
use crate::{
    config::TicketSettings,
    error::{StoreKind, TlsError},
};

/// 票据明文前缀：签发时间（UNIX 秒，大端）。
const ISSUED_AT_LEN: usize = 8;

/// 服务端会话票据上下文。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 票据加密密钥是服务端恢复能力的唯一状态，其生命周期必须由 `init`/`free` 显式界定；
/// - 票据无状态：服务端不保存会话，只凭密钥解封客户端带回的票据。
///
/// ## 逻辑（How）
/// - 密钥由 `rustls` 的 aws-lc-rs `Ticketer` 生成并按周期轮换；
/// - 签发时在明文前附加签发时间，解封时据此拒绝超过 `lifetime_secs` 的票据；
/// - 读路径通过 [`ArcSwapOption`] 获取密钥快照，写路径（`init`/`free`）由互斥锁串行化。
///
/// ## 契约（What）
/// - `init` 之前与 `free` 之后，`issue` 返回 [`TlsError::StoreNotInitialized`]；
/// - 重复 `init` 返回 [`TlsError::AlreadyInitialized`]；
/// - `free` 之后再 `init` 会生成全新密钥，旧票据全部失效。
pub struct TicketContext {
    keys: ArcSwapOption<TicketKeys>,
    writer: Mutex<()>,
    clock: UnixClock,
}

struct TicketKeys {
    sealer: Arc<dyn ProducesTickets>,
    lifetime_secs: u32,
    issued: AtomicU64,
}

impl TicketContext {
    pub fn new() -> Self {
        Self::with_clock(system_clock)
    }

    /// 使用自定义时钟创建上下文。
    pub fn with_clock(clock: UnixClock) -> Self {
        Self {
            keys: ArcSwapOption::empty(),
            writer: Mutex::new(()),
            clock,
        }
    }

    pub fn init(&self, settings: &TicketSettings) -> Result<(), TlsError> {
        if settings.lifetime_secs == 0 {
            return Err(TlsError::InvalidConfiguration(
                "票据有效期必须大于 0".into(),
            ));
        }
        let _guard = self.writer.lock();
        if self.keys.load().is_some() {
            warn!(
                code = "spark.tls.already_initialized",
                store = %StoreKind::TicketContext,
                "ticket context initialized twice"
            );
            return Err(TlsError::AlreadyInitialized(StoreKind::TicketContext));
        }
        let sealer = Ticketer::new().map_err(|error| {
            TlsError::ResourceExhausted(format!("票据密钥生成失败: {error}").into())
        })?;
        self.keys.store(Some(Arc::new(TicketKeys {
            sealer,
            lifetime_secs: settings.lifetime_secs,
            issued: AtomicU64::new(0),
        })));
        info!(lifetime_secs = settings.lifetime_secs, "ticket context initialized");
        Ok(())
    }

    pub fn free(&self) -> Result<(), TlsError> {
        let _guard = self.writer.lock();
        match self.keys.swap(None) {
            Some(previous) => {
                info!(
                    issued = previous.issued.load(Ordering::Relaxed),
                    "ticket context freed"
                );
                Ok(())
            }
            None => {
                warn!(
                    code = "spark.tls.store_not_initialized",
                    store = %StoreKind::TicketContext,
                    "ticket context freed while not initialized"
                );
                Err(TlsError::StoreNotInitialized(StoreKind::TicketContext))
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.load().is_some()
    }

    /// 当前票据有效期（秒）。
    pub fn lifetime_secs(&self) -> Result<u32, TlsError> {
        Ok(self.current()?.lifetime_secs)
    }

    /// 自 `init` 以来签发的票据数量。
    pub fn issued(&self) -> Result<u64, TlsError> {
        Ok(self.current()?.issued.load(Ordering::Relaxed))
    }

    /// 封装可恢复状态，返回不透明票据。
    pub fn issue(&self, state: &[u8]) -> Result<TicketBlob, TlsError> {
        let keys = self.current()?;
        let mut plain = Vec::with_capacity(ISSUED_AT_LEN + state.len());
        plain.extend_from_slice(&(self.clock)().to_be_bytes());
        plain.extend_from_slice(state);
        let sealed = keys
            .sealer
            .encrypt(&plain)
            .ok_or(TlsError::ResourceExhausted("票据加密失败".into()))?;
        keys.issued.fetch_add(1, Ordering::Relaxed);
        Ok(TicketBlob(sealed))
    }

    /// 解封票据；无法解密或已过期时返回 `Ok(None)`。
    pub fn open(&self, ticket: &[u8]) -> Result<Option<Vec<u8>>, TlsError> {
        let keys = self.current()?;
        let Some(plain) = keys.sealer.decrypt(ticket) else {
            debug!(len = ticket.len(), "ticket rejected: undecryptable");
            return Ok(None);
        };
        let Some((issued_at, state)) = plain.split_first_chunk::<ISSUED_AT_LEN>() else {
            debug!("ticket rejected: truncated");
            return Ok(None);
        };
        let age = (self.clock)().saturating_sub(u64::from_be_bytes(*issued_at));
        if age > u64::from(keys.lifetime_secs) {
            debug!(age, lifetime_secs = keys.lifetime_secs, "ticket rejected: expired");
            return Ok(None);
        }
        Ok(Some(state.to_vec()))
    }

    fn current(&self) -> Result<Arc<TicketKeys>, TlsError> {
        self.keys
            .load_full()
            .ok_or(TlsError::StoreNotInitialized(StoreKind::TicketContext))
    }
}

impl Default for TicketContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TicketContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.keys.load();
        f.debug_struct("TicketContext")
            .field("initialized", &keys.is_some())
            .field("lifetime_secs", &(*keys).as_ref().map(|keys| keys.lifetime_secs))
            .finish_non_exhaustive()
    }
}

/// 已加密的会话票据。
#[derive(Clone, PartialEq, Eq)]
pub struct TicketBlob(Vec<u8>);

impl TicketBlob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for TicketBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TicketBlob({} bytes)", self.0.len())
    }
}

/// 挂到单个服务端连接上的票据签发器，统计本连接签发的票据数。
#[derive(Debug)]
pub(crate) struct TicketIssuer {
    context: Arc<TicketContext>,
    issued: Arc<AtomicUsize>,
}

impl TicketIssuer {
    pub(crate) fn new(context: Arc<TicketContext>, issued: Arc<AtomicUsize>) -> Self {
        Self { context, issued }
    }
}

impl ProducesTickets for TicketIssuer {
    fn enabled(&self) -> bool {
        self.context.is_initialized()
    }

    fn lifetime(&self) -> u32 {
        self.context.lifetime_secs().unwrap_or(0)
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        match self.context.issue(plain) {
            Ok(ticket) => {
                self.issued.fetch_add(1, Ordering::Relaxed);
                Some(ticket.into_vec())
            }
            Err(error) => {
                warn!(code = error.code(), "session ticket not issued");
                None
            }
        }
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        match self.context.open(cipher) {
            Ok(state) => state,
            Err(error) => {
                warn!(code = error.code(), "session ticket not accepted");
                None
            }
        }
    }
}
