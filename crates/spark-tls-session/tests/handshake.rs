//! 非阻塞握手的端到端行为：建立、校验失败、删除协议与错误分类。

mod support;

use std::sync::Arc;

use anyhow::Result;
use spark_tls_session::{
    ClientOptions, FailureKind, HandshakeEngine, HandshakeState, HandshakeStatus, Interest, NameCheck,
    ProtocolVersion, RejectReason, ServerOptions, StoreKind, TlsContext, TlsError, TlsSettings,
    Transport, TrustSource, VerificationReport, Verdict, duplex,
};
use support::{TestPki, drive, trusting};

const PIPE: usize = 64 * 1024;

#[test]
fn handshake_establishes_and_reports_details() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;
    let (client_io, server_io) = duplex(PIPE);

    let mut client = engine.connect(
        "localhost",
        &ClientOptions::default().with_alpn(["h2"]),
        client_io,
    )?;
    let mut server = engine.accept(
        &identity,
        &ServerOptions::default().with_alpn(["h2", "http/1.1"]),
        server_io,
    )?;
    assert_eq!(client.state(), &HandshakeState::Uninitialized);
    assert_eq!(client.stats().bytes_written, 0, "句柄创建不应发送任何字节");

    let outcome = drive(&mut client, &mut server);
    assert!(outcome.both_established(), "{outcome:?}");
    assert!(client.is_established());
    assert_eq!(client.identity(), Some("localhost"));
    assert_eq!(server.identity(), None);

    let details = client.details()?;
    assert_eq!(details.protocol, Some(ProtocolVersion::Tls13));
    assert_eq!(details.alpn.as_deref(), Some(&b"h2"[..]));
    assert!(!details.resumed);
    assert_eq!(server.details()?.alpn.as_deref(), Some(&b"h2"[..]));

    let report = client.verification()?;
    assert_eq!(report.invocations, 1);
    assert_eq!(report.verdict, Some(Verdict::Accept));
    assert_eq!(server.verification()?, VerificationReport::default());
    assert_eq!(client.peer_certificates()?.map(|chain| chain.len()), Some(1));

    let calls = client.stats().continue_calls;
    assert_eq!(client.continue_handshake()?, HandshakeStatus::Established);
    assert_eq!(client.stats().continue_calls, calls, "终态调用不再推进");
    assert!(client.stats().round_trips >= 1);
    Ok(())
}

#[test]
fn expired_certificate_fails_both_sides() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.expired_leaf(&["localhost"])?.identity(&context)?;
    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect("localhost", &ClientOptions::default(), client_io)?;
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;

    let outcome = drive(&mut client, &mut server);
    assert_eq!(
        outcome.client,
        Err(TlsError::VerificationFailed(RejectReason::Expired))
    );
    let server_error = outcome.server.expect_err("服务端应收到证书告警");
    assert_eq!(server_error.failure_kind(), Some(FailureKind::Authentication));

    assert_eq!(
        client.state(),
        &HandshakeState::Failed(TlsError::VerificationFailed(RejectReason::Expired))
    );
    assert_eq!(
        client.continue_handshake(),
        Err(TlsError::VerificationFailed(RejectReason::Expired)),
        "失败终态保持不变"
    );
    assert_eq!(
        client.verification()?.verdict,
        Some(Verdict::Reject(RejectReason::Expired))
    );

    client.delete()?;
    assert_eq!(client.delete(), Err(TlsError::UseAfterFree("session handle")));
    server.delete()?;
    Ok(())
}

#[test]
fn unknown_issuer_is_untrusted() -> Result<()> {
    let trusted = TestPki::new()?;
    let rogue = TestPki::new()?;
    let context = trusting(&trusted)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = rogue.leaf(&["localhost"])?.identity(&context)?;
    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect("localhost", &ClientOptions::default(), client_io)?;
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;

    let outcome = drive(&mut client, &mut server);
    assert_eq!(
        outcome.client,
        Err(TlsError::VerificationFailed(RejectReason::ChainUntrusted))
    );
    assert!(outcome.server.is_err());
    Ok(())
}

#[test]
fn colliding_authority_name_is_untrusted() -> Result<()> {
    let trusted = TestPki::named("spark shared root")?;
    let impostor = TestPki::named("spark shared root")?;
    let context = trusting(&trusted)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = impostor.leaf(&["localhost"])?.identity(&context)?;

    for trust in [TrustSource::Global, TrustSource::Pem(trusted.ca_pem.clone())] {
        let (client_io, server_io) = duplex(PIPE);
        let options = ClientOptions::default().with_trust(trust);
        let mut client = engine.connect("localhost", &options, client_io)?;
        let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;
        let outcome = drive(&mut client, &mut server);
        assert_eq!(
            outcome.client,
            Err(TlsError::VerificationFailed(RejectReason::ChainUntrusted))
        );
        assert_eq!(
            client.verification()?.verdict,
            Some(Verdict::Reject(RejectReason::ChainUntrusted))
        );
    }
    Ok(())
}

#[test]
fn name_check_policies() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["backend.internal"])?.identity(&context)?;

    let cases = [
        (NameCheck::Hostname, Err(TlsError::VerificationFailed(RejectReason::HostnameMismatch))),
        (
            NameCheck::CommonName("backend.internal".to_owned()),
            Ok(HandshakeStatus::Established),
        ),
        (NameCheck::Skip, Ok(HandshakeStatus::Established)),
    ];
    for (check, expected) in cases {
        let (client_io, server_io) = duplex(PIPE);
        let options = ClientOptions::default().with_name_check(check.clone());
        let mut client = engine.connect("proxy.example", &options, client_io)?;
        let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;
        let outcome = drive(&mut client, &mut server);
        assert_eq!(outcome.client, expected, "{check:?}");
        assert_eq!(client.identity(), Some("proxy.example"));
    }
    Ok(())
}

#[test]
fn per_connection_trust_bypasses_shared_store() -> Result<()> {
    let pki = TestPki::new()?;
    let context = Arc::new(TlsContext::builder().build()?);
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;

    let (client_io, _server_io) = duplex(PIPE);
    assert_eq!(
        engine
            .connect("localhost", &ClientOptions::default(), client_io)
            .unwrap_err(),
        TlsError::StoreNotInitialized(StoreKind::TrustStore)
    );

    let (client_io, server_io) = duplex(PIPE);
    let options = ClientOptions::default().with_trust(TrustSource::Pem(pki.ca_pem.clone()));
    let mut client = engine.connect("localhost", &options, client_io)?;
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;
    let outcome = drive(&mut client, &mut server);
    assert!(outcome.both_established(), "{outcome:?}");
    assert!(!context.trust_store().is_initialized());
    Ok(())
}

#[test]
fn trust_store_freed_mid_handshake_fails_fast() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;
    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect("localhost", &ClientOptions::default(), client_io)?;
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;

    assert_eq!(client.continue_handshake()?, HandshakeStatus::WantRead);
    context.trust_store().free()?;

    let outcome = drive(&mut client, &mut server);
    assert_eq!(
        outcome.client,
        Err(TlsError::StoreNotInitialized(StoreKind::TrustStore))
    );
    let report = client.verification()?;
    assert!(report.store_unavailable);
    assert_eq!(report.verdict, None);
    Ok(())
}

#[test]
fn application_data_and_close_notify() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;
    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect("localhost", &ClientOptions::default(), client_io)?;
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;
    assert!(drive(&mut client, &mut server).both_established());

    let mut buf = [0u8; 64];
    assert_eq!(server.read(&mut buf), Err(TlsError::WouldBlock(Interest::Read)));

    assert_eq!(client.write(b"ping")?, 4);
    client.flush()?;
    let n = server.read(&mut buf)?;
    assert_eq!(&buf[..n], b"ping");

    assert_eq!(server.write(b"pong")?, 4);
    let n = client.read(&mut buf)?;
    assert_eq!(&buf[..n], b"pong");

    client.delete()?;
    assert_eq!(server.read(&mut buf)?, 0, "close_notify 表现为 EOF");
    Ok(())
}

#[test]
fn deleted_handle_rejects_every_operation() -> Result<()> {
    let context = Arc::new(TlsContext::builder().build()?);
    let engine = HandshakeEngine::new(context);
    let (client_io, _server_io) = duplex(PIPE);
    let options = ClientOptions::default().with_trust(TrustSource::Pem(TestPki::new()?.ca_pem));
    let mut client = engine.connect("localhost", &options, client_io)?;

    client.delete()?;
    assert!(client.is_deleted());
    let freed = TlsError::UseAfterFree("session handle");
    let mut buf = [0u8; 8];
    assert_eq!(client.continue_handshake(), Err(freed.clone()));
    assert_eq!(client.read(&mut buf), Err(freed.clone()));
    assert_eq!(client.write(b"x"), Err(freed.clone()));
    assert_eq!(client.flush(), Err(freed.clone()));
    assert_eq!(client.details(), Err(freed.clone()));
    assert_eq!(client.bytes_available(), Err(freed.clone()));
    assert_eq!(client.delete(), Err(freed.clone()));
    assert!(freed.is_lifecycle_misuse());
    assert_eq!(client.state(), &HandshakeState::Uninitialized);
    Ok(())
}

#[test]
fn application_data_requires_established_session() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context);
    let (client_io, _server_io) = duplex(PIPE);
    let mut client = engine.connect("localhost", &ClientOptions::default(), client_io)?;
    let mut buf = [0u8; 8];
    let error = client.read(&mut buf).unwrap_err();
    assert_eq!(error.failure_kind(), Some(FailureKind::Incomplete));
    let error = client.write(b"early").unwrap_err();
    assert_eq!(error.failure_kind(), Some(FailureKind::Incomplete));
    Ok(())
}

#[test]
fn garbage_from_peer_is_an_integrity_failure() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;
    let (mut peer, server_io) = duplex(PIPE);
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;
    assert_eq!(server.continue_handshake()?, HandshakeStatus::WantRead);

    peer.write(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let error = server.continue_handshake().unwrap_err();
    assert_eq!(error.failure_kind(), Some(FailureKind::Integrity), "{error}");
    assert!(matches!(server.state(), HandshakeState::Failed(_)));
    Ok(())
}

#[test]
fn peer_closing_mid_handshake_is_reported() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context);
    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect("localhost", &ClientOptions::default(), client_io)?;
    assert_eq!(client.continue_handshake()?, HandshakeStatus::WantRead);
    assert!(client.stats().bytes_written > 0);
    drop(server_io);

    let error = client.continue_handshake().unwrap_err();
    assert_eq!(error.failure_kind(), Some(FailureKind::ConnectionClosed));
    Ok(())
}

#[test]
fn alpn_mismatch_is_incompatible() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;
    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect(
        "localhost",
        &ClientOptions::default().with_alpn(["h2"]),
        client_io,
    )?;
    let mut server = engine.accept(
        &identity,
        &ServerOptions::default().with_alpn(["http/1.1"]),
        server_io,
    )?;

    let outcome = drive(&mut client, &mut server);
    let server_error = outcome.server.expect_err("服务端应拒绝");
    assert_eq!(server_error.failure_kind(), Some(FailureKind::Incompatible));
    let client_error = outcome.client.expect_err("客户端应收到告警");
    assert_eq!(client_error.failure_kind(), Some(FailureKind::Incompatible));
    Ok(())
}

#[test]
fn protocol_and_suite_restrictions_apply() -> Result<()> {
    let pki = TestPki::new()?;
    let context = trusting(&pki)?;
    let engine = HandshakeEngine::new(context.clone());
    let identity = pki.leaf(&["localhost"])?.identity(&context)?;

    let (client_io, server_io) = duplex(PIPE);
    let options = ClientOptions::default().with_cipher_suites(["TLS13_AES_256_GCM_SHA384"]);
    let mut client = engine.connect("localhost", &options, client_io)?;
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;
    assert!(drive(&mut client, &mut server).both_established());
    let suite = client.details()?.cipher_suite.expect("negotiated suite");
    assert_eq!(suite.id, 0x1302);

    let (client_io, server_io) = duplex(PIPE);
    let options = ClientOptions::default().with_versions([ProtocolVersion::Tls12]);
    let mut client = engine.connect("localhost", &options, client_io)?;
    let mut server = engine.accept(&identity, &ServerOptions::default(), server_io)?;
    assert!(drive(&mut client, &mut server).both_established());
    assert_eq!(client.details()?.protocol, Some(ProtocolVersion::Tls12));
    assert_eq!(client.stats().round_trips, 2);

    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect(
        "localhost",
        &ClientOptions::default().with_versions([ProtocolVersion::Tls12]),
        client_io,
    )?;
    let mut server = engine.accept(
        &identity,
        &ServerOptions::default().with_versions([ProtocolVersion::Tls13]),
        server_io,
    )?;
    let outcome = drive(&mut client, &mut server);
    assert_eq!(
        outcome.server.expect_err("版本不重叠").failure_kind(),
        Some(FailureKind::Incompatible)
    );

    let (client_io, _server_io) = duplex(PIPE);
    let unknown = ClientOptions::default().with_cipher_suites(["TLS_NULL_WITH_NULL_NULL"]);
    assert!(matches!(
        engine.connect("localhost", &unknown, client_io),
        Err(TlsError::InvalidConfiguration(_))
    ));
    Ok(())
}

#[test]
fn settings_document_drives_both_sides() -> Result<()> {
    let pki = TestPki::new()?;
    let settings = TlsSettings::from_toml_str(
        r#"
        cipher_suites = ["TLS13_AES_128_GCM_SHA256", "TLS13_CHACHA20_POLY1305_SHA256"]

        [client]
        alpn = ["spark/1"]

        [server]
        alpn = ["spark/1"]
        "#,
    )?;
    let context = Arc::new(TlsContext::from_settings(&settings)?);
    context.trust_store().set(pki.ca_pem.as_bytes())?;
    assert_eq!(context.cipher_suites().ids(), vec![0x1301, 0x1303]);
    let engine = HandshakeEngine::new(context.clone());
    let leaf = pki.leaf(&["localhost"])?;
    let identity = context.server_identity_from_pem(leaf.pem.as_bytes(), leaf.key_pem.as_bytes())?;

    let (client_io, server_io) = duplex(PIPE);
    let mut client = engine.connect("localhost", &settings.client, client_io)?;
    let mut server = engine.accept(&identity, &settings.server, server_io)?;
    let outcome = drive(&mut client, &mut server);
    assert!(outcome.both_established(), "{outcome:?}");
    let details = client.details()?;
    assert_eq!(details.alpn.as_deref(), Some(&b"spark/1"[..]));
    assert_eq!(details.cipher_suite.map(|suite| suite.id), Some(0x1301));
    Ok(())
}
