//! 集成测试共用的测试 PKI 与锁步驱动器。
#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, date_time_ymd,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spark_tls_session::{
    HandshakeStatus, MemoryTransport, ServerIdentity, SessionHandle, TlsContext, TlsError,
};

/// 单个测试用的私有 CA。
pub struct TestPki {
    pub ca_pem: String,
    pub ca_der: CertificateDer<'static>,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

/// CA 签发的服务端证书链与私钥。
pub struct Leaf {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub pem: String,
    pub key_pem: String,
}

static NEXT_CA: AtomicUsize = AtomicUsize::new(0);

impl TestPki {
    /// 每次调用生成一个主题名唯一的 CA。
    pub fn new() -> Result<Self> {
        let serial = NEXT_CA.fetch_add(1, Ordering::Relaxed);
        Self::named(&format!("spark tls session test ca {serial}"))
    }

    /// 指定 CA 主题名；同名 CA 用于构造主题冲突的伪造根。
    pub fn named(common_name: &str) -> Result<Self> {
        let ca_key = KeyPair::generate().context("生成 CA 私钥失败")?;
        let mut params = CertificateParams::new(Vec::<String>::new()).context("构造 CA 参数失败")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let ca_cert = params.self_signed(&ca_key).context("签发 CA 证书失败")?;
        Ok(Self {
            ca_pem: ca_cert.pem(),
            ca_der: ca_cert.der().clone(),
            ca_cert,
            ca_key,
        })
    }

    pub fn leaf(&self, hosts: &[&str]) -> Result<Leaf> {
        let params = self.leaf_params(hosts)?;
        self.sign(params)
    }

    /// 有效期停留在 2000 年的证书。
    pub fn expired_leaf(&self, hosts: &[&str]) -> Result<Leaf> {
        let mut params = self.leaf_params(hosts)?;
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
        self.sign(params)
    }

    fn leaf_params(&self, hosts: &[&str]) -> Result<CertificateParams> {
        let names = hosts.iter().map(|host| host.to_string()).collect::<Vec<_>>();
        let mut params = CertificateParams::new(names).context("构造证书参数失败")?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        if let Some(first) = hosts.first() {
            params.distinguished_name.push(DnType::CommonName, *first);
        }
        Ok(params)
    }

    fn sign(&self, params: CertificateParams) -> Result<Leaf> {
        let key = KeyPair::generate().context("生成证书私钥失败")?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .context("签发服务端证书失败")?;
        Ok(Leaf {
            chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
            pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

impl Leaf {
    pub fn identity(&self, context: &TlsContext) -> Result<ServerIdentity> {
        Ok(context.server_identity(self.chain.clone(), self.key.clone_key())?)
    }
}

/// 构建信任库已装入 `pki` 根证书的上下文。
pub fn trusting(pki: &TestPki) -> Result<Arc<TlsContext>> {
    let context = TlsContext::builder().build()?;
    context.trust_store().set(pki.ca_pem.as_bytes())?;
    Ok(Arc::new(context))
}

/// 锁步驱动两端的握手结果。
#[derive(Debug)]
pub struct Outcome {
    pub client: Result<HandshakeStatus, TlsError>,
    pub server: Result<HandshakeStatus, TlsError>,
}

impl Outcome {
    pub fn both_established(&self) -> bool {
        matches!(self.client, Ok(HandshakeStatus::Established))
            && matches!(self.server, Ok(HandshakeStatus::Established))
    }
}

const MAX_STEPS: usize = 10_000;

/// 一端进入终态后，另一端最多再推进的空转次数。
const SETTLE_STEPS: usize = 8;

/// 在单线程内交替推进两端，直到都进入终态或另一端不再前进。
pub fn drive(
    client: &mut SessionHandle<MemoryTransport>,
    server: &mut SessionHandle<MemoryTransport>,
) -> Outcome {
    let mut client_status = client.continue_handshake();
    let mut server_status = server.continue_handshake();
    let mut settle = 0;
    for _ in 0..MAX_STEPS {
        let client_done = is_terminal(&client_status);
        let server_done = is_terminal(&server_status);
        if client_done && server_done {
            break;
        }
        if client_done || server_done {
            settle += 1;
            if settle > SETTLE_STEPS {
                break;
            }
        }
        if !client_done {
            client_status = client.continue_handshake();
        }
        if !server_done {
            server_status = server.continue_handshake();
        }
    }
    Outcome {
        client: client_status,
        server: server_status,
    }
}

fn is_terminal(status: &Result<HandshakeStatus, TlsError>) -> bool {
    matches!(status, Ok(HandshakeStatus::Established) | Err(_))
}
