use std::{fmt, sync::Arc};

use rustls::{
    crypto::{CryptoProvider, aws_lc_rs},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use tracing::debug;

use crate::{
    cipher::CipherSuiteRegistry,
    config::{SessionCacheSettings, TlsSettings},
    error::TlsError,
    resumption::{ClientSessionCache, TicketContext, UnixClock, system_clock},
    trust::{TrustStore, parse_certificates},
    verify::{CertificateVerifier, WebPkiVerifier},
};

/// 所有连接共享的 TLS 状态。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把信任库、套件注册表、票据密钥、客户端会话缓存、校验器与 crypto provider
///   收拢为一个显式对象，由调用方注入 [`crate::HandshakeEngine`]，而不是隐藏为进程级全局量；
/// - 同一进程可以并存多套互不干扰的上下文（例如测试）。
///
/// ## 契约（What）
/// - 构造后成员引用不变；信任库与票据上下文自身的 init/free 生命周期独立管理；
/// - 可被多个线程通过 `Arc<TlsContext>` 同时读取。
pub struct TlsContext {
    provider: Arc<CryptoProvider>,
    cipher_suites: CipherSuiteRegistry,
    trust_store: Arc<TrustStore>,
    tickets: Arc<TicketContext>,
    client_sessions: Arc<ClientSessionCache>,
    verifier: Arc<dyn CertificateVerifier>,
}

impl TlsContext {
    pub fn builder() -> TlsContextBuilder {
        TlsContextBuilder::default()
    }

    /// 按配置文件构建上下文；票据上下文与信任库仍需调用方显式初始化。
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, TlsError> {
        settings.validate()?;
        Self::builder()
            .cipher_suites(settings.cipher_suites.iter().cloned())
            .session_cache(settings.session_cache)
            .build()
    }

    pub fn provider(&self) -> &Arc<CryptoProvider> {
        &self.provider
    }

    pub fn cipher_suites(&self) -> &CipherSuiteRegistry {
        &self.cipher_suites
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust_store
    }

    pub fn ticket_context(&self) -> &Arc<TicketContext> {
        &self.tickets
    }

    pub fn client_sessions(&self) -> &Arc<ClientSessionCache> {
        &self.client_sessions
    }

    pub fn verifier(&self) -> &Arc<dyn CertificateVerifier> {
        &self.verifier
    }

    /// 由证书链与私钥构造服务端身份。
    pub fn server_identity(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<ServerIdentity, TlsError> {
        if chain.is_empty() {
            return Err(TlsError::InvalidMaterial("服务端证书链为空".into()));
        }
        let signing_key = self
            .provider
            .key_provider
            .load_private_key(key)
            .map_err(|error| TlsError::InvalidMaterial(format!("私钥不可用: {error}").into()))?;
        Ok(ServerIdentity {
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    /// 由 PEM 文本构造服务端身份。
    pub fn server_identity_from_pem(
        &self,
        chain_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<ServerIdentity, TlsError> {
        let chain = parse_certificates(chain_pem)?;
        let key = PrivateKeyDer::from_pem_slice(key_pem)
            .map_err(|error| TlsError::InvalidMaterial(format!("私钥 PEM 解析失败: {error}").into()))?;
        self.server_identity(chain, key)
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("cipher_suites", &self.cipher_suites)
            .field("trust_store", &self.trust_store)
            .field("tickets", &self.tickets)
            .field("client_sessions", &self.client_sessions)
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

/// [`TlsContext`] 构建器。
pub struct TlsContextBuilder {
    provider: Option<Arc<CryptoProvider>>,
    cipher_suites: Vec<String>,
    session_cache: SessionCacheSettings,
    verifier: Option<Arc<dyn CertificateVerifier>>,
    clock: UnixClock,
}

impl Default for TlsContextBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            cipher_suites: Vec::new(),
            session_cache: SessionCacheSettings::default(),
            verifier: None,
            clock: system_clock,
        }
    }
}

impl TlsContextBuilder {
    /// 替换 crypto provider；默认使用 aws-lc-rs。
    pub fn provider(mut self, provider: Arc<CryptoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// 把注册表收窄为给定套件（保持给定顺序）。
    pub fn cipher_suites<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.cipher_suites = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_cache(mut self, settings: SessionCacheSettings) -> Self {
        self.session_cache = settings;
        self
    }

    /// 替换证书校验器；默认使用 webpki。
    pub fn verifier(mut self, verifier: Arc<dyn CertificateVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// 注入票据与会话缓存使用的时钟。
    pub fn clock(mut self, clock: UnixClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<TlsContext, TlsError> {
        if self.session_cache.capacity == 0 {
            return Err(TlsError::InvalidConfiguration(
                "session_cache.capacity 必须大于 0".into(),
            ));
        }
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(aws_lc_rs::default_provider()));
        let cipher_suites =
            CipherSuiteRegistry::from_provider(&provider)?.restrict(&self.cipher_suites)?;
        let verifier = self
            .verifier
            .unwrap_or_else(|| Arc::new(WebPkiVerifier::new(provider.clone())));
        debug!(suites = cipher_suites.len(), "tls context built");
        Ok(TlsContext {
            provider,
            cipher_suites,
            trust_store: Arc::new(TrustStore::new()),
            tickets: Arc::new(TicketContext::with_clock(self.clock)),
            client_sessions: Arc::new(ClientSessionCache::with_clock(
                self.session_cache,
                self.clock,
            )),
            verifier,
        })
    }
}

/// 服务端身份：证书链 + 签名密钥。
#[derive(Clone, Debug)]
pub struct ServerIdentity {
    certified: Arc<CertifiedKey>,
}

impl ServerIdentity {
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified.cert
    }

    pub(crate) fn resolver(&self) -> Arc<dyn ResolvesServerCert> {
        Arc::new(StaticIdentity(self.certified.clone()))
    }
}

#[derive(Debug)]
struct StaticIdentity(Arc<CertifiedKey>);

impl ResolvesServerCert for StaticIdentity {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}
