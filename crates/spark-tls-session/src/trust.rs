use std::{collections::BTreeMap, fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, pem::PemObject};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{StoreKind, TlsError};

const PEM_MARKER: &[u8] = b"-----BEGIN";

/// 进程级（由 `TlsContext` 持有）的受信任 CA 证书库。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 所有握手共享同一份信任根，读取必须无锁且可并发；
/// - 初始化与释放是显式动作，误用需要确定性报错。
///
/// ## 逻辑（How）
/// - 读取端通过 [`ArcSwapOption`] 取得 [`TrustAnchors`] 快照，快照在持有期间不会变化；
/// - 写入端（`init`/`set`/`free`）先获取 `writer` 互斥锁，复制当前快照、修改后整体替换，
///   与热更新配置的 RCU 写法一致；
/// - `free` 将指针置空，此后新的握手读取到 `None` 并快速失败，已持有快照的读者不受影响。
///
/// ## 契约（What）
/// - `init` 重复调用返回 [`TlsError::AlreadyInitialized`]；
/// - `get`/`free` 在未初始化或已释放时返回 [`TlsError::StoreNotInitialized`]；
/// - `set` 在未初始化时隐式初始化后再追加证书；任一证书无效则整体不生效。
///
/// ## 风险与权衡（Trade-offs）
/// - 写入期间不阻止读者；“握手进行中不得写入”是文档约定而非强制检查。
pub struct TrustStore {
    anchors: ArcSwapOption<TrustAnchors>,
    writer: Mutex<()>,
}

impl TrustStore {
    /// 创建一个尚未初始化的信任库。
    pub fn new() -> Self {
        Self {
            anchors: ArcSwapOption::empty(),
            writer: Mutex::new(()),
        }
    }

    /// 由 PEM/DER 材料直接构建一个已初始化的信任库，用于单连接的自定义 CA。
    pub fn from_certificates(bytes: &[u8]) -> Result<Self, TlsError> {
        let store = Self::new();
        store.init()?;
        store.set(bytes)?;
        Ok(store)
    }

    pub fn init(&self) -> Result<(), TlsError> {
        let _guard = self.writer.lock();
        if self.anchors.load().is_some() {
            warn!(
                code = "spark.tls.already_initialized",
                store = %StoreKind::TrustStore,
                "trust store initialized twice"
            );
            return Err(TlsError::AlreadyInitialized(StoreKind::TrustStore));
        }
        self.anchors.store(Some(Arc::new(TrustAnchors::empty())));
        info!("trust store initialized");
        Ok(())
    }

    /// 追加受信任证书，返回本次新增（去重后）的证书数量。
    pub fn set(&self, bytes: &[u8]) -> Result<usize, TlsError> {
        let certificates = parse_certificates(bytes)?;
        let _guard = self.writer.lock();
        let current = match self.anchors.load_full() {
            Some(current) => current,
            None => {
                debug!("trust store set before init, initializing implicitly");
                Arc::new(TrustAnchors::empty())
            }
        };
        let (next, added) = current.extended(certificates)?;
        let total = next.len();
        self.anchors.store(Some(Arc::new(next)));
        info!(added, total, "trust store updated");
        Ok(added)
    }

    /// 返回当前快照。
    pub fn get(&self) -> Result<Arc<TrustAnchors>, TlsError> {
        self.anchors
            .load_full()
            .ok_or(TlsError::StoreNotInitialized(StoreKind::TrustStore))
    }

    pub fn free(&self) -> Result<(), TlsError> {
        let _guard = self.writer.lock();
        match self.anchors.swap(None) {
            Some(previous) => {
                info!(released = previous.len(), "trust store freed");
                Ok(())
            }
            None => {
                warn!(
                    code = "spark.tls.store_not_initialized",
                    store = %StoreKind::TrustStore,
                    "trust store freed while not initialized"
                );
                Err(TlsError::StoreNotInitialized(StoreKind::TrustStore))
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.anchors.load().is_some()
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let anchors = self.anchors.load();
        f.debug_struct("TrustStore")
            .field("initialized", &anchors.is_some())
            .field("anchors", &(*anchors).as_ref().map(|a| a.len()))
            .finish()
    }
}

/// 证书身份：DER 编码的 SHA-256 指纹。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(certificate: &CertificateDer<'_>) -> Self {
        Self(Sha256::digest(certificate.as_ref()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// 信任库的只读快照。
#[derive(Clone)]
pub struct TrustAnchors {
    certificates: BTreeMap<Fingerprint, CertificateDer<'static>>,
    roots: Arc<RootCertStore>,
}

impl TrustAnchors {
    fn empty() -> Self {
        Self {
            certificates: BTreeMap::new(),
            roots: Arc::new(RootCertStore::empty()),
        }
    }

    fn extended(
        &self,
        certificates: Vec<CertificateDer<'static>>,
    ) -> Result<(Self, usize), TlsError> {
        let mut next = self.certificates.clone();
        let mut roots = (*self.roots).clone();
        let mut added = 0;
        for certificate in certificates {
            let fingerprint = Fingerprint::of(&certificate);
            if next.contains_key(&fingerprint) {
                continue;
            }
            roots.add(certificate.clone()).map_err(|error| {
                TlsError::InvalidMaterial(format!("CA {fingerprint} 无法作为信任根: {error}").into())
            })?;
            next.insert(fingerprint, certificate);
            added += 1;
        }
        Ok((
            Self {
                certificates: next,
                roots: Arc::new(roots),
            },
            added,
        ))
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.certificates.contains_key(fingerprint)
    }

    pub fn fingerprints(&self) -> impl Iterator<Item = &Fingerprint> {
        self.certificates.keys()
    }

    pub fn certificate(&self, fingerprint: &Fingerprint) -> Option<&CertificateDer<'static>> {
        self.certificates.get(fingerprint)
    }

    /// 供 webpki 使用的根证书集合。
    pub fn root_store(&self) -> Arc<RootCertStore> {
        self.roots.clone()
    }
}

impl fmt::Debug for TrustAnchors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchors")
            .field("fingerprints", &self.certificates.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 解析 PEM（可含多张证书）或单张 DER 证书。
///
/// 以 NUL 结尾的 PEM 缓冲区（C 风格字符串）同样接受。
pub(crate) fn parse_certificates(bytes: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let trimmed = match bytes.iter().rposition(|byte| *byte != 0) {
        Some(last) => &bytes[..=last],
        None => return Err(TlsError::InvalidMaterial("证书材料为空".into())),
    };
    if !trimmed.windows(PEM_MARKER.len()).any(|window| window == PEM_MARKER) {
        return Ok(vec![CertificateDer::from(trimmed.to_vec())]);
    }
    let certificates = CertificateDer::pem_slice_iter(trimmed)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| TlsError::InvalidMaterial(format!("PEM 解析失败: {error}").into()))?;
    if certificates.is_empty() {
        return Err(TlsError::InvalidMaterial("PEM 中没有 CERTIFICATE 块".into()));
    }
    Ok(certificates)
}
