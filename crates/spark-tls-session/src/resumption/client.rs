use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;
use rustls::{
    NamedGroup,
    client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue},
};
use rustls_pki_types::ServerName;
use tracing::{debug, info};

use super::{UnixClock, lru::BoundedCache, system_clock};
use crate::{
    config::SessionCacheSettings,
    error::TlsError,
    session::{Role, SessionHandle},
    transport::Transport,
};

/// 每个服务器身份最多保留的 TLS 1.3 票据数。
const MAX_TLS13_TICKETS: usize = 8;

/// 带独立截止时间的恢复材料。
struct Stamped<V> {
    value: V,
    expires_at: u64,
}

impl<V> Stamped<V> {
    fn is_live_at(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// 某个服务器身份的可恢复会话材料。
///
/// 不可克隆：一份材料只能被 `restore` 回缓存或被 `free` 释放一次。
/// TLS 1.2 会话与每张 TLS 1.3 票据各自按写入时间计算截止时间。
pub struct ClientSession {
    identity: String,
    kx_hint: Option<NamedGroup>,
    tls12: Option<Stamped<Tls12ClientSessionValue>>,
    tls13: VecDeque<Stamped<Tls13ClientSessionValue>>,
    created_at: u64,
    expires_at: u64,
    /// 负责该槽位的客户端句柄；句柄删除时槽位随之失效。
    owner: Option<u64>,
}

impl ClientSession {
    fn new(identity: String, now: u64, lifetime_secs: u64) -> Self {
        Self {
            identity,
            kx_hint: None,
            tls12: None,
            tls13: VecDeque::new(),
            created_at: now,
            expires_at: now.saturating_add(lifetime_secs),
            owner: None,
        }
    }

    /// 服务器身份（连接时使用的主机名）。
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// 最晚一份材料的截止时间。
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// 是否含有可用于简化握手的材料。
    pub fn is_resumable(&self) -> bool {
        self.tls12.is_some() || !self.tls13.is_empty()
    }

    pub fn has_tls12_session(&self) -> bool {
        self.tls12.is_some()
    }

    pub fn tls13_tickets(&self) -> usize {
        self.tls13.len()
    }

    /// 丢弃已过截止时间的单份材料。
    fn prune(&mut self, now: u64) {
        if self.tls12.as_ref().is_some_and(|session| !session.is_live_at(now)) {
            self.tls12 = None;
        }
        self.tls13.retain(|ticket| ticket.is_live_at(now));
    }

    fn stamp<V>(&mut self, value: V, now: u64, lifetime_secs: u64) -> Stamped<V> {
        let expires_at = now.saturating_add(lifetime_secs);
        self.expires_at = self.expires_at.max(expires_at);
        Stamped { value, expires_at }
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("identity", &self.identity)
            .field("kx_hint", &self.kx_hint)
            .field("tls12", &self.tls12.is_some())
            .field("tls13_tickets", &self.tls13.len())
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("owner", &self.owner)
            .finish()
    }
}

/// 客户端会话缓存。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以服务器身份为键保存 TLS 1.2 会话与 TLS 1.3 票据，使重连可以走简化握手；
/// - 容量固定，超出时按最近最少使用淘汰，单份材料在自身生命周期结束后惰性失效。
///
/// ## 逻辑（How）
/// - 每个客户端连接通过 [`OwnedSessionStore`] 接入 rustls，握手完成（或收到
///   NewSessionTicket）时写入，并把槽位记到该连接名下；
/// - 应用可通过 [`ClientSessionCache::get`] 取出材料，稍后交给
///   `HandshakeEngine::resume` 重新放回，或交给 [`ClientSessionCache::free`] 释放；
/// - 负责槽位的句柄被删除而材料未被取出时，槽位随句柄一起失效。
///
/// ## 契约（What）
/// - 服务端拒绝恢复时 rustls 会调用 `remove_tls12_session`，随后在同一握手内回落到完整握手；
/// - 所有方法内部加锁，可被多个握手并发调用。
pub struct ClientSessionCache {
    entries: Mutex<BoundedCache<String, ClientSession>>,
    lifetime_secs: u64,
    clock: UnixClock,
}

impl ClientSessionCache {
    pub fn new(settings: SessionCacheSettings) -> Self {
        Self::with_clock(settings, system_clock)
    }

    /// 使用自定义时钟创建缓存。
    pub fn with_clock(settings: SessionCacheSettings, clock: UnixClock) -> Self {
        Self {
            entries: Mutex::new(BoundedCache::new(settings.capacity)),
            lifetime_secs: settings.lifetime_secs,
            clock,
        }
    }

    /// 取出句柄所连服务器的会话材料；取出后缓存中不再保留。
    pub fn get<T: Transport>(
        &self,
        handle: &SessionHandle<T>,
    ) -> Result<Option<ClientSession>, TlsError> {
        if handle.is_deleted() {
            return Err(TlsError::UseAfterFree("session handle"));
        }
        if handle.role() != Role::Client {
            return Err(TlsError::InvalidConfiguration(
                "服务端句柄没有客户端会话".into(),
            ));
        }
        Ok(handle.identity().and_then(|identity| self.take(identity)))
    }

    /// 按身份取出会话材料。
    pub fn take(&self, identity: &str) -> Option<ClientSession> {
        let now = (self.clock)();
        let mut session = self.entries.lock().remove(&identity.to_owned())?;
        if session.is_expired_at(now) {
            debug!(identity, "client session expired");
            return None;
        }
        session.prune(now);
        session.owner = None;
        session.is_resumable().then_some(session)
    }

    /// 将先前取出的材料放回缓存；已过期或不可恢复的材料被丢弃并返回 `false`。
    pub fn restore(&self, session: ClientSession) -> bool {
        self.restore_owned(session, None)
    }

    pub(crate) fn restore_owned(&self, mut session: ClientSession, owner: Option<u64>) -> bool {
        let now = (self.clock)();
        session.prune(now);
        if session.is_expired_at(now) || !session.is_resumable() {
            debug!(identity = session.identity(), "discarding stale client session");
            return false;
        }
        session.owner = owner;
        let identity = session.identity.clone();
        if let Some((evicted, _)) = self.entries.lock().insert(identity.clone(), session) {
            debug!(evicted = %evicted, "client session evicted");
        }
        debug!(identity = %identity, "client session restored");
        true
    }

    /// 释放会话材料，并使该身份的缓存槽失效。
    pub fn free(&self, session: ClientSession) {
        let identity = session.identity;
        let invalidated = self.entries.lock().remove(&identity).is_some();
        info!(identity = %identity, invalidated, "client session freed");
    }

    /// 使某个身份的缓存失效，返回是否存在条目。
    pub fn invalidate(&self, identity: &str) -> bool {
        let removed = self.entries.lock().remove(&identity.to_owned()).is_some();
        if removed {
            debug!(identity, "client session invalidated");
        }
        removed
    }

    /// 句柄删除时调用：槽位仍记在该句柄名下才失效，返回是否移除了条目。
    pub(crate) fn release_owner(&self, identity: &str, owner: u64) -> bool {
        let key = identity.to_owned();
        let mut entries = self.entries.lock();
        if entries.peek(&key).is_some_and(|session| session.owner == Some(owner)) {
            entries.remove(&key);
            debug!(identity, handle = owner, "client session released with its handle");
            return true;
        }
        false
    }

    /// 是否持有某个身份的有效可恢复材料。
    pub fn contains(&self, identity: &str) -> bool {
        let now = (self.clock)();
        self.entries.lock().peek(&identity.to_owned()).is_some_and(|session| {
            !session.is_expired_at(now)
                && (session.tls12.as_ref().is_some_and(|s| s.is_live_at(now))
                    || session.tls13.iter().any(|ticket| ticket.is_live_at(now)))
        })
    }

    /// 清理过期条目，返回清理数量。
    pub fn purge_expired(&self) -> usize {
        let now = (self.clock)();
        let purged = self
            .entries
            .lock()
            .remove_where(|session| session.is_expired_at(now));
        if purged > 0 {
            debug!(purged, "expired client sessions purged");
        }
        purged
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().capacity()
    }

    /// 为某个客户端句柄创建 rustls 会话存储。
    pub(crate) fn store_for(self: &Arc<Self>, owner: u64) -> OwnedSessionStore {
        OwnedSessionStore {
            cache: self.clone(),
            owner,
        }
    }

    fn read<R>(
        &self,
        server_name: &ServerName<'_>,
        visit: impl FnOnce(&mut ClientSession) -> R,
    ) -> Option<R> {
        let identity = server_name.to_str().into_owned();
        let now = (self.clock)();
        let mut entries = self.entries.lock();
        let expired = entries.get_mut(&identity)?.is_expired_at(now);
        if expired {
            entries.remove(&identity);
            debug!(identity = %identity, "client session expired");
            return None;
        }
        entries.get_mut(&identity).map(|session| {
            session.prune(now);
            visit(session)
        })
    }

    fn update(
        &self,
        server_name: &ServerName<'_>,
        owner: u64,
        apply: impl FnOnce(&mut ClientSession, u64, u64),
    ) {
        let identity = server_name.to_str().into_owned();
        let now = (self.clock)();
        let mut entries = self.entries.lock();
        let stale = entries
            .get_mut(&identity)
            .map(|session| session.is_expired_at(now));
        if stale != Some(false) {
            let fresh = ClientSession::new(identity.clone(), now, self.lifetime_secs);
            if let Some((evicted, _)) = entries.insert(identity.clone(), fresh) {
                debug!(evicted = %evicted, "client session evicted");
            }
        }
        if let Some(session) = entries.get_mut(&identity) {
            session.owner = Some(owner);
            apply(session, now, self.lifetime_secs);
        }
    }
}

impl fmt::Debug for ClientSessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("ClientSessionCache")
            .field("len", &entries.len())
            .field("capacity", &entries.capacity())
            .field("lifetime_secs", &self.lifetime_secs)
            .finish()
    }
}

/// 挂在单个客户端连接上的会话存储；写入的槽位记在该连接名下。
#[derive(Debug)]
pub(crate) struct OwnedSessionStore {
    cache: Arc<ClientSessionCache>,
    owner: u64,
}

impl ClientSessionStore for OwnedSessionStore {
    fn set_kx_hint(&self, server_name: ServerName<'static>, group: NamedGroup) {
        self.cache
            .update(&server_name, self.owner, |session, _, _| session.kx_hint = Some(group));
    }

    fn kx_hint(&self, server_name: &ServerName<'_>) -> Option<NamedGroup> {
        self.cache.read(server_name, |session| session.kx_hint).flatten()
    }

    fn set_tls12_session(&self, server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        self.cache
            .update(&server_name, self.owner, |session, now, lifetime| {
                session.tls12 = Some(session.stamp(value, now, lifetime));
            });
    }

    fn tls12_session(&self, server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.cache
            .read(server_name, |session| {
                session.tls12.as_ref().map(|stamped| stamped.value.clone())
            })
            .flatten()
    }

    fn remove_tls12_session(&self, server_name: &ServerName<'static>) {
        self.cache.read(server_name, |session| session.tls12 = None);
    }

    fn insert_tls13_ticket(&self, server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.cache
            .update(&server_name, self.owner, |session, now, lifetime| {
                if session.tls13.len() == MAX_TLS13_TICKETS {
                    session.tls13.pop_front();
                }
                let ticket = session.stamp(value, now, lifetime);
                session.tls13.push_back(ticket);
            });
    }

    fn take_tls13_ticket(&self, server_name: &ServerName<'static>) -> Option<Tls13ClientSessionValue> {
        self.cache
            .read(server_name, |session| session.tls13.pop_back().map(|stamped| stamped.value))
            .flatten()
    }
}
