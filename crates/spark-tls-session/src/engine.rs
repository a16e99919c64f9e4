use std::{
    io,
    sync::{Arc, atomic::AtomicUsize},
};

use rustls::{
    ClientConfig, ClientConnection, ServerConfig, ServerConnection,
    client::Resumption,
    server::NoServerSessionStorage,
};
use rustls_pki_types::ServerName;
use tracing::{debug, info, warn};

use crate::{
    backend::RustlsBackend,
    config::{ClientOptions, NameCheck, ServerOptions, TrustSource, rustls_versions},
    context::{ServerIdentity, TlsContext},
    error::{self, StoreKind, TlsError},
    resumption::{ClientSession, TicketIssuer},
    session::{
        Flush, HandshakeState, HandshakeStatus, HandshakeStep, Live, Role, SessionHandle,
        flush_records, next_handle_id,
    },
    transport::{IoCounters, IoShim, Transport},
    trust::TrustStore,
    verify::{HandshakeVerifier, VerificationLog},
};

/// 握手引擎：为客户端与服务端创建会话句柄并推进握手。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接建立拆成“创建句柄（不收发任何字节）”与“逐步推进”两段，
///   使调用方可以把握手嵌入自己的事件循环；
/// - 简单场景提供 `*_blocking` 入口，内部循环调用 `continue_handshake` 直至终态。
///
/// ## 逻辑（How）
/// - `connect`/`accept` 根据选项派生每连接的 rustls 配置：协议版本、套件子集、ALPN、
///   信任源与名称策略（客户端）、票据签发器（服务端）；
/// - 共享状态全部来自注入的 [`TlsContext`]。
///
/// ## 契约（What）
/// - 客户端若选择共享信任库而库未初始化，`connect` 直接返回 `StoreNotInitialized`；
/// - 服务端若启用票据而票据上下文未初始化，`accept` 直接返回 `StoreNotInitialized`。
#[derive(Clone, Debug)]
pub struct HandshakeEngine {
    context: Arc<TlsContext>,
}

impl HandshakeEngine {
    pub fn new(context: Arc<TlsContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<TlsContext> {
        &self.context
    }

    /// 创建客户端句柄。
    pub fn connect<T: Transport>(
        &self,
        hostname: &str,
        options: &ClientOptions,
        transport: T,
    ) -> Result<SessionHandle<T>, TlsError> {
        self.client_handle(hostname, options, None, transport)
    }

    /// 携带先前取出的会话材料创建客户端句柄，尝试简化握手。
    ///
    /// 材料先放回共享缓存并记到新句柄名下，再由握手读取；服务端拒绝恢复时回落到完整握手。
    /// 材料所属身份与 `hostname` 不一致时返回 `InvalidConfiguration`。
    pub fn resume<T: Transport>(
        &self,
        hostname: &str,
        options: &ClientOptions,
        session: ClientSession,
        transport: T,
    ) -> Result<SessionHandle<T>, TlsError> {
        self.client_handle(hostname, options, Some(session), transport)
    }

    /// 创建服务端句柄。
    pub fn accept<T: Transport>(
        &self,
        identity: &ServerIdentity,
        options: &ServerOptions,
        transport: T,
    ) -> Result<SessionHandle<T>, TlsError> {
        let provider = self
            .context
            .cipher_suites()
            .provider_for(self.context.provider(), &options.cipher_suites)?;
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&rustls_versions(&options.versions))
            .map_err(|e| error::from_rustls(&e))?
            .with_no_client_auth()
            .with_cert_resolver(identity.resolver());
        config.alpn_protocols = alpn_protocols(&options.alpn);
        config.session_storage = Arc::new(NoServerSessionStorage {});
        let issued = Arc::new(AtomicUsize::new(0));
        if options.session_tickets {
            let tickets = self.context.ticket_context();
            if !tickets.is_initialized() {
                warn!(
                    code = "spark.tls.store_not_initialized",
                    "session tickets requested before ticket context init"
                );
                return Err(TlsError::StoreNotInitialized(StoreKind::TicketContext));
            }
            config.ticketer = Arc::new(TicketIssuer::new(tickets.clone(), issued.clone()));
            config.send_tls13_tickets = options.tls13_tickets;
        } else {
            config.send_tls13_tickets = 0;
        }
        let conn = ServerConnection::new(Arc::new(config)).map_err(|e| error::from_rustls(&e))?;
        Ok(SessionHandle::new(
            next_handle_id(),
            Role::Server,
            None,
            Box::new(RustlsBackend::server(conn, issued)),
            transport,
        ))
    }

    /// 同步客户端握手，适用于阻塞传输。
    pub fn connect_blocking<T: Transport>(
        &self,
        hostname: &str,
        options: &ClientOptions,
        transport: T,
    ) -> Result<SessionHandle<T>, TlsError> {
        let mut handle = self.connect(hostname, options, transport)?;
        handle.complete_handshake()?;
        Ok(handle)
    }

    /// 同步服务端握手（创建 + 推进至终态）。
    pub fn accept_blocking<T: Transport>(
        &self,
        identity: &ServerIdentity,
        options: &ServerOptions,
        transport: T,
    ) -> Result<SessionHandle<T>, TlsError> {
        let mut handle = self.accept(identity, options, transport)?;
        handle.complete_handshake()?;
        Ok(handle)
    }

    fn client_handle<T: Transport>(
        &self,
        hostname: &str,
        options: &ClientOptions,
        session: Option<ClientSession>,
        transport: T,
    ) -> Result<SessionHandle<T>, TlsError> {
        let server_name = ServerName::try_from(hostname.to_owned()).map_err(|_| {
            TlsError::InvalidConfiguration(format!("无效的服务器名称: {hostname}").into())
        })?;
        let identity = server_name.to_str().into_owned();
        if let Some(session) = &session
            && session.identity() != identity
        {
            return Err(TlsError::InvalidConfiguration(
                format!("会话属于 {}，不能用于连接 {identity}", session.identity()).into(),
            ));
        }
        let (name_override, skip_name_check) = match &options.name_check {
            NameCheck::Hostname => (None, false),
            NameCheck::CommonName(name) => {
                let name = ServerName::try_from(name.clone()).map_err(|_| {
                    TlsError::InvalidConfiguration(format!("无效的证书名称: {name}").into())
                })?;
                (Some(name), false)
            }
            NameCheck::Skip => (None, true),
        };
        let trust = match &options.trust {
            TrustSource::Global => {
                let store = self.context.trust_store().clone();
                store.get()?;
                store
            }
            TrustSource::Pem(pem) => Arc::new(TrustStore::from_certificates(pem.as_bytes())?),
        };
        let provider = self
            .context
            .cipher_suites()
            .provider_for(self.context.provider(), &options.cipher_suites)?;
        let log = Arc::new(VerificationLog::default());
        let verifier = Arc::new(HandshakeVerifier::new(
            trust,
            self.context.verifier().clone(),
            provider.clone(),
            name_override,
            skip_name_check,
            log.clone(),
        ));
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&rustls_versions(&options.versions))
            .map_err(|e| error::from_rustls(&e))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        config.alpn_protocols = alpn_protocols(&options.alpn);
        let id = next_handle_id();
        let mut session_cache = None;
        if options.resumption {
            let cache = self.context.client_sessions();
            if let Some(session) = session {
                cache.restore_owned(session, Some(id));
            }
            config.resumption = Resumption::store(Arc::new(cache.store_for(id)));
            session_cache = Some(cache.clone());
        } else {
            if session.is_some() {
                debug!(identity = %identity, "resumption disabled, carried session dropped");
            }
            config.resumption = Resumption::disabled();
        }
        let conn = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| error::from_rustls(&e))?;
        let handle = SessionHandle::new(
            id,
            Role::Client,
            Some(identity),
            Box::new(RustlsBackend::client(conn, log)),
            transport,
        );
        Ok(match session_cache {
            Some(cache) => handle.with_session_cache(cache),
            None => handle,
        })
    }
}

fn alpn_protocols(protocols: &[String]) -> Vec<Vec<u8>> {
    protocols
        .iter()
        .map(|protocol| protocol.as_bytes().to_vec())
        .collect()
}

enum Receive {
    Processed,
    Blocked,
}

impl<T: Transport> SessionHandle<T> {
    /// 推进一步握手。
    ///
    /// # 教案级注释
    ///
    /// ## 逻辑（How）
    /// 1. 先把排队的握手记录写入传输，写阻塞则返回 `WantWrite`；
    /// 2. 若握手已完成，转为 `Established`；
    /// 3. 否则读取对端记录并交给 TLS 引擎处理；读阻塞返回 `WantRead`；
    /// 4. 首次读取之后，只在传输报告仍有可读字节时继续，保证单次调用有界。
    ///
    /// ## 契约（What）
    /// - 从不阻塞（前提是传输为非阻塞）；`WantRead`/`WantWrite` 保留全部握手状态；
    /// - 进入 `Established` 或失败后，后续调用不做任何 I/O，直接返回同一终态；
    /// - 失败时尽力把 TLS 告警发给对端；句柄已删除时返回 `UseAfterFree`。
    pub fn continue_handshake(&mut self) -> Result<HandshakeStatus, TlsError> {
        self.live()?;
        match &self.state {
            HandshakeState::Established => return Ok(HandshakeStatus::Established),
            HandshakeState::Failed(error) => return Err(error.clone()),
            HandshakeState::Uninitialized => {
                debug!(handle = self.id, role = %self.role, "tls handshake started");
            }
            HandshakeState::InProgress(_) => {}
        }
        self.continue_calls += 1;
        match self.advance() {
            Ok(HandshakeStatus::Established) => {
                self.establish();
                Ok(HandshakeStatus::Established)
            }
            Ok(status) => Ok(status),
            Err(error) => Err(self.fail(error)),
        }
    }

    /// 循环推进直至终态；`WantRead`/`WantWrite` 时让出线程后重试。
    pub fn complete_handshake(&mut self) -> Result<(), TlsError> {
        loop {
            match self.continue_handshake()? {
                HandshakeStatus::Established => return Ok(()),
                HandshakeStatus::WantRead | HandshakeStatus::WantWrite => {
                    std::thread::yield_now();
                }
            }
        }
    }

    fn advance(&mut self) -> Result<HandshakeStatus, TlsError> {
        let Self {
            live,
            counters,
            state,
            ..
        } = self;
        let live = live.as_mut().ok_or(TlsError::UseAfterFree("session handle"))?;
        let mut received = false;
        loop {
            if flush_records(live, &mut *counters, error::HANDSHAKE)? == Flush::Blocked {
                *state = HandshakeState::InProgress(HandshakeStep::Flushing);
                return Ok(HandshakeStatus::WantWrite);
            }
            if !live.backend.is_handshaking() {
                return Ok(HandshakeStatus::Established);
            }
            if received && live.transport.bytes_available() == 0 {
                *state = HandshakeState::InProgress(HandshakeStep::AwaitingPeer);
                return Ok(HandshakeStatus::WantRead);
            }
            match receive_records(live, &mut *counters)? {
                Receive::Processed => received = true,
                Receive::Blocked => {
                    *state = HandshakeState::InProgress(HandshakeStep::AwaitingPeer);
                    return Ok(HandshakeStatus::WantRead);
                }
            }
        }
    }

    fn establish(&mut self) {
        self.state = HandshakeState::Established;
        if let Some(live) = &self.live {
            let details = live.backend.details();
            info!(
                handle = self.id,
                role = %self.role,
                identity = self.identity.as_deref(),
                protocol = ?details.protocol,
                cipher_suite = details.cipher_suite.as_ref().map(|suite| suite.name.as_str()),
                resumed = details.resumed,
                round_trips = self.counters.round_trips,
                continue_calls = self.continue_calls,
                "tls handshake established"
            );
        }
    }

    fn fail(&mut self, cause: TlsError) -> TlsError {
        if let Some(live) = self.live.as_mut() {
            // 告警尽力送达，失败不覆盖原始错误。
            let _ = flush_records(live, &mut self.counters, error::HANDSHAKE);
        }
        warn!(
            handle = self.id,
            role = %self.role,
            code = cause.code(),
            error = %cause,
            "tls handshake failed"
        );
        self.state = HandshakeState::Failed(cause.clone());
        cause
    }
}

fn receive_records<T: Transport>(
    live: &mut Live<T>,
    counters: &mut IoCounters,
) -> Result<Receive, TlsError> {
    let mut shim = IoShim::new(&mut live.transport, counters);
    match live.backend.read_tls(&mut shim) {
        Ok(0) => Err(error::connection_closed(error::HANDSHAKE)),
        Ok(_) => {
            live.records = live.backend.process_records()?;
            Ok(Receive::Processed)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Receive::Blocked),
        Err(e) => Err(error::from_io(error::HANDSHAKE, e)),
    }
}
