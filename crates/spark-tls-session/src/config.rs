//! 会话编排层的声明式配置。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 把散落在各入口的连接参数（协议版本、ALPN、套件、信任源、票据参数）收敛为强类型结构，
//!   既能在代码中逐项构造，也能从 TOML 文件整体加载；
//! - 解析与校验分离：`serde` 负责语法，[`TlsSettings::validate`] 负责语义约束。
//!
//! ## 契约（What）
//! - 所有字段都有默认值，空文档即合法配置；
//! - 语义错误统一返回 [`TlsError::InvalidConfiguration`]。

use rustls::SupportedProtocolVersion;
use serde::Deserialize;

use crate::error::TlsError;

/// 可协商的协议版本。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    #[serde(alias = "tls1.2")]
    Tls12,
    #[serde(alias = "tls1.3")]
    Tls13,
}

impl ProtocolVersion {
    pub(crate) fn to_rustls(self) -> &'static SupportedProtocolVersion {
        match self {
            ProtocolVersion::Tls12 => &rustls::version::TLS12,
            ProtocolVersion::Tls13 => &rustls::version::TLS13,
        }
    }

    pub(crate) fn from_rustls(version: rustls::ProtocolVersion) -> Option<Self> {
        match version {
            rustls::ProtocolVersion::TLSv1_2 => Some(ProtocolVersion::Tls12),
            rustls::ProtocolVersion::TLSv1_3 => Some(ProtocolVersion::Tls13),
            _ => None,
        }
    }
}

/// 空列表表示启用全部受支持版本。
pub(crate) fn rustls_versions(
    versions: &[ProtocolVersion],
) -> Vec<&'static SupportedProtocolVersion> {
    if versions.is_empty() {
        return rustls::DEFAULT_VERSIONS.to_vec();
    }
    let mut selected: Vec<&'static SupportedProtocolVersion> = Vec::with_capacity(versions.len());
    for version in versions {
        let rustls_version = version.to_rustls();
        if !selected.iter().any(|known| known.version == rustls_version.version) {
            selected.push(rustls_version);
        }
    }
    selected
}

/// 服务器证书的名称匹配策略。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameCheck {
    /// 按连接时的主机名匹配。
    #[default]
    Hostname,
    /// 以给定名称代替主机名参与匹配。
    CommonName(String),
    /// 跳过名称匹配，仍校验证书链与有效期。
    Skip,
}

/// 客户端信任源。
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustSource {
    /// 使用 `TlsContext` 持有的共享信任库。
    #[default]
    Global,
    /// 仅信任给定 PEM 中的 CA，替代共享信任库。
    Pem(String),
}

/// 客户端连接选项。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientOptions {
    pub versions: Vec<ProtocolVersion>,
    pub alpn: Vec<String>,
    pub cipher_suites: Vec<String>,
    /// 是否读写客户端会话缓存。
    pub resumption: bool,
    pub name_check: NameCheck,
    pub trust: TrustSource,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
            alpn: Vec::new(),
            cipher_suites: Vec::new(),
            resumption: true,
            name_check: NameCheck::default(),
            trust: TrustSource::default(),
        }
    }
}

impl ClientOptions {
    pub fn with_versions(mut self, versions: impl IntoIterator<Item = ProtocolVersion>) -> Self {
        self.versions = versions.into_iter().collect();
        self
    }

    pub fn with_alpn<S: Into<String>>(mut self, protocols: impl IntoIterator<Item = S>) -> Self {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cipher_suites<S: Into<String>>(
        mut self,
        suites: impl IntoIterator<Item = S>,
    ) -> Self {
        self.cipher_suites = suites.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resumption(mut self, enabled: bool) -> Self {
        self.resumption = enabled;
        self
    }

    pub fn with_name_check(mut self, check: NameCheck) -> Self {
        self.name_check = check;
        self
    }

    pub fn with_trust(mut self, trust: TrustSource) -> Self {
        self.trust = trust;
        self
    }
}

/// 服务端会话选项。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    pub versions: Vec<ProtocolVersion>,
    pub alpn: Vec<String>,
    pub cipher_suites: Vec<String>,
    /// 启用后要求票据上下文已初始化。
    pub session_tickets: bool,
    /// TLS 1.3 握手完成后下发的票据数量。
    pub tls13_tickets: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            versions: Vec::new(),
            alpn: Vec::new(),
            cipher_suites: Vec::new(),
            session_tickets: false,
            tls13_tickets: 2,
        }
    }
}

impl ServerOptions {
    pub fn with_versions(mut self, versions: impl IntoIterator<Item = ProtocolVersion>) -> Self {
        self.versions = versions.into_iter().collect();
        self
    }

    pub fn with_alpn<S: Into<String>>(mut self, protocols: impl IntoIterator<Item = S>) -> Self {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cipher_suites<S: Into<String>>(
        mut self,
        suites: impl IntoIterator<Item = S>,
    ) -> Self {
        self.cipher_suites = suites.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_session_tickets(mut self, enabled: bool) -> Self {
        self.session_tickets = enabled;
        self
    }

    pub fn with_tls13_tickets(mut self, count: usize) -> Self {
        self.tls13_tickets = count;
        self
    }
}

/// 票据上下文参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TicketSettings {
    /// 票据自签发起的有效期（秒）。
    pub lifetime_secs: u32,
}

impl Default for TicketSettings {
    fn default() -> Self {
        Self {
            lifetime_secs: DEFAULT_LIFETIME_SECS as u32,
        }
    }
}

/// 客户端会话缓存参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionCacheSettings {
    /// 最多缓存的服务器身份数量，超出后按最近最少使用淘汰。
    pub capacity: usize,
    pub lifetime_secs: u64,
}

impl Default for SessionCacheSettings {
    fn default() -> Self {
        Self {
            capacity: 64,
            lifetime_secs: DEFAULT_LIFETIME_SECS,
        }
    }
}

/// 两小时，与常见 TLS 栈的会话缓存默认值一致。
const DEFAULT_LIFETIME_SECS: u64 = 7200;

/// 配置文件根结构。
///
/// ```toml
/// cipher_suites = ["TLS13_AES_128_GCM_SHA256"]
///
/// [session_cache]
/// capacity = 128
///
/// [client]
/// alpn = ["h2"]
/// name_check = { common_name = "edge.internal" }
///
/// [server]
/// session_tickets = true
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
    /// 注册表收窄后的套件列表；为空表示沿用 provider 的全部套件。
    pub cipher_suites: Vec<String>,
    pub session_cache: SessionCacheSettings,
    pub tickets: TicketSettings,
    pub client: ClientOptions,
    pub server: ServerOptions,
}

impl TlsSettings {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(raw: &str) -> Result<Self, TlsError> {
        let settings: Self = toml::from_str(raw).map_err(|error| {
            TlsError::InvalidConfiguration(format!("TLS 配置解析失败: {error}").into())
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), TlsError> {
        if self.session_cache.capacity == 0 {
            return Err(TlsError::InvalidConfiguration(
                "session_cache.capacity 必须大于 0".into(),
            ));
        }
        if self.session_cache.lifetime_secs == 0 {
            return Err(TlsError::InvalidConfiguration(
                "session_cache.lifetime_secs 必须大于 0".into(),
            ));
        }
        if self.tickets.lifetime_secs == 0 {
            return Err(TlsError::InvalidConfiguration(
                "tickets.lifetime_secs 必须大于 0".into(),
            ));
        }
        for protocol in self.client.alpn.iter().chain(&self.server.alpn) {
            if protocol.is_empty() || protocol.len() > 255 {
                return Err(TlsError::InvalidConfiguration(
                    format!("ALPN 协议名长度必须在 1..=255 之间: {protocol:?}").into(),
                ));
            }
        }
        Ok(())
    }
}
