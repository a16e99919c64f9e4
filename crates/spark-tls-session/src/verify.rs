//! 证书校验：纯函数式校验器与握手期间的 rustls 适配器。
//!
//! [`CertificateVerifier`] 只读取 [`TrustAnchors`] 快照，给出 [`Verdict`]；
//! `HandshakeVerifier` 负责在握手中定位信任库、执行名称策略，并把结论记录到
//! `VerificationLog`，供句柄事后查询。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use parking_lot::Mutex;
use rustls::{
    CertificateError, DigitallySignedStruct, Error as RustlsError, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::{debug, warn};

use crate::trust::{TrustAnchors, TrustStore};

/// 拒绝原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// 证书链无法连到任何受信任根。
    ChainUntrusted,
    Expired,
    NotYetValid,
    HostnameMismatch,
    Revoked,
    RevocationUnknown,
    /// 证书编码损坏或包含无法处理的关键扩展。
    Malformed,
    BadSignature,
    Other,
}

impl RejectReason {
    /// 稳定诊断码。
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::ChainUntrusted => "spark.tls.verify.chain_untrusted",
            RejectReason::Expired => "spark.tls.verify.expired",
            RejectReason::NotYetValid => "spark.tls.verify.not_yet_valid",
            RejectReason::HostnameMismatch => "spark.tls.verify.hostname_mismatch",
            RejectReason::Revoked => "spark.tls.verify.revoked",
            RejectReason::RevocationUnknown => "spark.tls.verify.revocation_unknown",
            RejectReason::Malformed => "spark.tls.verify.malformed",
            RejectReason::BadSignature => "spark.tls.verify.bad_signature",
            RejectReason::Other => "spark.tls.verify.other",
        }
    }

    pub(crate) fn from_certificate_error(error: &CertificateError) -> Self {
        match error {
            CertificateError::UnknownIssuer => RejectReason::ChainUntrusted,
            CertificateError::Expired | CertificateError::ExpiredContext { .. } => {
                RejectReason::Expired
            }
            CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => {
                RejectReason::NotYetValid
            }
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
                RejectReason::HostnameMismatch
            }
            CertificateError::Revoked => RejectReason::Revoked,
            CertificateError::UnknownRevocationStatus
            | CertificateError::ExpiredRevocationList
            | CertificateError::ExpiredRevocationListContext { .. } => {
                RejectReason::RevocationUnknown
            }
            CertificateError::BadEncoding | CertificateError::UnhandledCriticalExtension => {
                RejectReason::Malformed
            }
            CertificateError::BadSignature => RejectReason::BadSignature,
            _ => RejectReason::Other,
        }
    }

    pub(crate) fn to_certificate_error(self) -> CertificateError {
        match self {
            RejectReason::ChainUntrusted => CertificateError::UnknownIssuer,
            RejectReason::Expired => CertificateError::Expired,
            RejectReason::NotYetValid => CertificateError::NotValidYet,
            RejectReason::HostnameMismatch => CertificateError::NotValidForName,
            RejectReason::Revoked => CertificateError::Revoked,
            RejectReason::RevocationUnknown => CertificateError::UnknownRevocationStatus,
            RejectReason::Malformed => CertificateError::BadEncoding,
            RejectReason::BadSignature => CertificateError::BadSignature,
            RejectReason::Other => CertificateError::ApplicationVerificationFailure,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectReason::ChainUntrusted => "certificate chain is not trusted",
            RejectReason::Expired => "certificate expired",
            RejectReason::NotYetValid => "certificate not yet valid",
            RejectReason::HostnameMismatch => "certificate does not match hostname",
            RejectReason::Revoked => "certificate revoked",
            RejectReason::RevocationUnknown => "certificate revocation status unknown",
            RejectReason::Malformed => "certificate malformed",
            RejectReason::BadSignature => "certificate signature invalid",
            RejectReason::Other => "certificate rejected",
        };
        f.write_str(label)
    }
}

/// 校验结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// 对端在握手中出示的证书链。
#[derive(Clone, Copy, Debug)]
pub struct PeerChain<'a> {
    pub end_entity: &'a CertificateDer<'a>,
    pub intermediates: &'a [CertificateDer<'a>],
    /// 参与名称匹配的服务器名；已按名称策略替换。
    pub server_name: &'a ServerName<'a>,
    pub ocsp_response: &'a [u8],
}

/// 证书校验器。
///
/// # 契约（What）
/// - 纯函数：只读取 `anchors`，不得修改任何缓存或共享状态；
/// - 每次握手至多调用一次；返回 `Reject` 只终止当前握手。
pub trait CertificateVerifier: fmt::Debug + Send + Sync {
    fn verify(&self, chain: &PeerChain<'_>, anchors: &TrustAnchors, now: UnixTime) -> Verdict;
}

/// 基于 webpki 的默认校验器。
#[derive(Debug, Clone)]
pub struct WebPkiVerifier {
    provider: Arc<CryptoProvider>,
}

impl WebPkiVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl CertificateVerifier for WebPkiVerifier {
    fn verify(&self, chain: &PeerChain<'_>, anchors: &TrustAnchors, now: UnixTime) -> Verdict {
        let webpki =
            match WebPkiServerVerifier::builder_with_provider(anchors.root_store(), self.provider.clone())
                .build()
            {
                Ok(verifier) => verifier,
                // 空信任库无法构建校验器，等价于链不可信。
                Err(_) => return Verdict::Reject(RejectReason::ChainUntrusted),
            };
        match webpki.verify_server_cert(
            chain.end_entity,
            chain.intermediates,
            chain.server_name,
            chain.ocsp_response,
            now,
        ) {
            Ok(_) => Verdict::Accept,
            // 链上签名无法被任何同名的受信任根验证，等价于链不可信。
            Err(RustlsError::InvalidCertificate(CertificateError::BadSignature)) => {
                Verdict::Reject(RejectReason::ChainUntrusted)
            }
            Err(RustlsError::InvalidCertificate(error)) => {
                Verdict::Reject(RejectReason::from_certificate_error(&error))
            }
            Err(_) => Verdict::Reject(RejectReason::Other),
        }
    }
}

/// 单次握手的校验记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifyOutcome {
    Verdict(Verdict),
    /// 握手触达信任库时，信任库已被释放。
    StoreUnavailable,
}

#[derive(Debug, Default)]
pub(crate) struct VerificationLog {
    invocations: AtomicU32,
    outcome: Mutex<Option<VerifyOutcome>>,
}

impl VerificationLog {
    fn record(&self, outcome: VerifyOutcome) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        *self.outcome.lock() = Some(outcome);
    }

    pub(crate) fn outcome(&self) -> Option<VerifyOutcome> {
        *self.outcome.lock()
    }

    pub(crate) fn report(&self) -> VerificationReport {
        let outcome = self.outcome();
        VerificationReport {
            invocations: self.invocations.load(Ordering::Relaxed),
            verdict: match outcome {
                Some(VerifyOutcome::Verdict(verdict)) => Some(verdict),
                _ => None,
            },
            store_unavailable: matches!(outcome, Some(VerifyOutcome::StoreUnavailable)),
        }
    }
}

/// 握手结束后可查询的校验报告。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerificationReport {
    /// 校验器被调用的次数；会话恢复的 TLS 1.3 握手为 0。
    pub invocations: u32,
    pub verdict: Option<Verdict>,
    pub store_unavailable: bool,
}

/// 每个客户端句柄独享的 rustls 校验适配器。
#[derive(Debug)]
pub(crate) struct HandshakeVerifier {
    trust: Arc<TrustStore>,
    verifier: Arc<dyn CertificateVerifier>,
    provider: Arc<CryptoProvider>,
    name_override: Option<ServerName<'static>>,
    skip_name_check: bool,
    log: Arc<VerificationLog>,
}

impl HandshakeVerifier {
    pub(crate) fn new(
        trust: Arc<TrustStore>,
        verifier: Arc<dyn CertificateVerifier>,
        provider: Arc<CryptoProvider>,
        name_override: Option<ServerName<'static>>,
        skip_name_check: bool,
        log: Arc<VerificationLog>,
    ) -> Self {
        Self {
            trust,
            verifier,
            provider,
            name_override,
            skip_name_check,
            log,
        }
    }
}

impl ServerCertVerifier for HandshakeVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        let anchors = match self.trust.get() {
            Ok(anchors) => anchors,
            Err(error) => {
                warn!(code = error.code(), "trust store released before certificate verification");
                self.log.record(VerifyOutcome::StoreUnavailable);
                return Err(RustlsError::General(error.to_string()));
            }
        };
        let chain = PeerChain {
            end_entity,
            intermediates,
            server_name: self.name_override.as_ref().unwrap_or(server_name),
            ocsp_response,
        };
        let mut verdict = self.verifier.verify(&chain, &anchors, now);
        if self.skip_name_check && verdict == Verdict::Reject(RejectReason::HostnameMismatch) {
            verdict = Verdict::Accept;
        }
        self.log.record(VerifyOutcome::Verdict(verdict));
        match verdict {
            Verdict::Accept => {
                debug!(anchors = anchors.len(), "peer certificate accepted");
                Ok(ServerCertVerified::assertion())
            }
            Verdict::Reject(reason) => {
                warn!(code = reason.code(), "peer certificate rejected");
                Err(RustlsError::InvalidCertificate(reason.to_certificate_error()))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [RejectReason; 9] = [
        RejectReason::ChainUntrusted,
        RejectReason::Expired,
        RejectReason::NotYetValid,
        RejectReason::HostnameMismatch,
        RejectReason::Revoked,
        RejectReason::RevocationUnknown,
        RejectReason::Malformed,
        RejectReason::BadSignature,
        RejectReason::Other,
    ];

    #[test]
    fn reject_reasons_survive_rustls_error_mapping() {
        for reason in ALL {
            let mapped = RejectReason::from_certificate_error(&reason.to_certificate_error());
            assert_eq!(mapped, reason, "{}", reason.code());
        }
    }

    #[test]
    fn log_reports_last_verdict() {
        let log = VerificationLog::default();
        assert_eq!(log.report(), VerificationReport::default());
        log.record(VerifyOutcome::Verdict(Verdict::Reject(RejectReason::Expired)));
        let report = log.report();
        assert_eq!(report.invocations, 1);
        assert_eq!(report.verdict, Some(Verdict::Reject(RejectReason::Expired)));
        assert!(!report.store_unavailable);
    }
}
