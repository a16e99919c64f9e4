use std::{fmt, sync::Arc};

use rustls::{SupportedCipherSuite, crypto::CryptoProvider};

use crate::{config::ProtocolVersion, error::TlsError};

/// 可协商密码套件的有序集合。
///
/// 构造后只读；顺序即协商优先级。引擎为每个连接按选项挑选子集，
/// 再派生出只包含该子集的 `CryptoProvider`。
#[derive(Clone)]
pub struct CipherSuiteRegistry {
    suites: Arc<[SupportedCipherSuite]>,
}

impl CipherSuiteRegistry {
    /// 以 `provider` 声明的套件与顺序构建注册表。
    pub fn from_provider(provider: &CryptoProvider) -> Result<Self, TlsError> {
        Self::new(provider.cipher_suites.clone())
    }

    /// 去重（保留首次出现的位置）后构建；空列表视为配置错误。
    pub fn new(suites: Vec<SupportedCipherSuite>) -> Result<Self, TlsError> {
        let mut ordered: Vec<SupportedCipherSuite> = Vec::with_capacity(suites.len());
        for suite in suites {
            if !ordered.iter().any(|known| known.suite() == suite.suite()) {
                ordered.push(suite);
            }
        }
        if ordered.is_empty() {
            return Err(TlsError::InvalidConfiguration(
                "密码套件注册表不能为空".into(),
            ));
        }
        Ok(Self {
            suites: ordered.into(),
        })
    }

    pub fn suites(&self) -> &[SupportedCipherSuite] {
        &self.suites
    }

    pub fn len(&self) -> usize {
        self.suites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    /// IANA 编号，按优先级排列。
    pub fn ids(&self) -> Vec<u16> {
        self.suites.iter().map(|suite| u16::from(suite.suite())).collect()
    }

    pub fn describe(&self) -> Vec<CipherSuiteInfo> {
        self.suites.iter().map(CipherSuiteInfo::from).collect()
    }

    /// 按名称（如 `TLS13_AES_128_GCM_SHA256`，大小写不敏感）或十六进制编号（如 `0x1301`）查找。
    pub fn find(&self, name: &str) -> Option<SupportedCipherSuite> {
        let wanted = name.trim();
        let numeric = wanted
            .strip_prefix("0x")
            .or_else(|| wanted.strip_prefix("0X"))
            .and_then(|hex| u16::from_str_radix(hex, 16).ok());
        self.suites.iter().copied().find(|suite| {
            let info = CipherSuiteInfo::from(suite);
            match numeric {
                Some(id) => info.id == id,
                None => info.name.eq_ignore_ascii_case(wanted),
            }
        })
    }

    /// 按请求顺序挑选子集；空请求返回全集，未知名称为配置错误。
    pub fn select(&self, names: &[String]) -> Result<Vec<SupportedCipherSuite>, TlsError> {
        if names.is_empty() {
            return Ok(self.suites.to_vec());
        }
        let mut selected: Vec<SupportedCipherSuite> = Vec::with_capacity(names.len());
        for name in names {
            let suite = self.find(name).ok_or_else(|| {
                TlsError::InvalidConfiguration(format!("未知或未注册的密码套件: {name}").into())
            })?;
            if !selected.iter().any(|known| known.suite() == suite.suite()) {
                selected.push(suite);
            }
        }
        Ok(selected)
    }

    /// 收窄为名称列表对应的子注册表。
    pub fn restrict(&self, names: &[String]) -> Result<Self, TlsError> {
        Self::new(self.select(names)?)
    }

    /// 派生只包含所选套件的 provider。
    pub(crate) fn provider_for(
        &self,
        base: &CryptoProvider,
        names: &[String],
    ) -> Result<Arc<CryptoProvider>, TlsError> {
        let mut provider = base.clone();
        provider.cipher_suites = self.select(names)?;
        Ok(Arc::new(provider))
    }
}

impl fmt::Debug for CipherSuiteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.suites.iter().map(|suite| suite.suite()))
            .finish()
    }
}

/// 密码套件的可读描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CipherSuiteInfo {
    pub id: u16,
    pub name: String,
    pub version: Option<ProtocolVersion>,
}

impl From<&SupportedCipherSuite> for CipherSuiteInfo {
    fn from(suite: &SupportedCipherSuite) -> Self {
        Self {
            id: u16::from(suite.suite()),
            name: format!("{:?}", suite.suite()),
            version: ProtocolVersion::from_rustls(suite.version().version),
        }
    }
}
