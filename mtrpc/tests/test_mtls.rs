mod common;

use common::{TestServer, anonymous_security, default_chain, untrusted_identity};
use mtrpc::*;

async fn connect(server: &TestServer, security: &SecurityContext) -> Result<Client> {
    Client::connect(server.addr, security, ClientConfig::default()).await
}

fn untrusted_security(server: &TestServer) -> SecurityContext {
    let (cert, key) = untrusted_identity();
    SecurityContext::client_from_pem(
        Some((cert.as_bytes(), key.as_bytes())),
        server.pki.ca.as_bytes(),
        "localhost",
    )
    .unwrap()
}

/// Handshake failures may surface on connect or, with TLS 1.3, on the
/// first call over the rejected connection.
async fn assert_rejected(server: &TestServer, security: &SecurityContext) {
    let before = server.server.connections().len();
    match connect(server, security).await {
        Err(e) => {
            assert_eq!(e.kind, ErrorKind::Handshake, "{e}");
            // rejected before a connection, and so any call, existed
            assert_eq!(server.server.connections().len(), before);
        }
        Ok(client) => {
            let err = client
                .unary::<_, String>("Echo/echo", &"x".to_string())
                .await
                .unwrap_err();
            panic!("connection was accepted, call failed with {err}");
        }
    }
}

#[tokio::test]
async fn test_require_and_verify() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;

    let client = server.client().await;
    let rsp: String = client.unary("Echo/echo", &"trusted".to_string()).await.unwrap();
    assert_eq!(rsp, "trusted");

    // the server sees the client's certificate
    let fingerprint: Option<String> = client.unary("Echo/whoami", &()).await.unwrap();
    let fingerprint = fingerprint.unwrap();
    assert_eq!(fingerprint.len(), 64);
    assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));

    // and the client sees the server's
    let server_identity = client.connection().peer().unwrap();
    assert_ne!(server_identity.fingerprint(), fingerprint);

    assert_rejected(&server, &anonymous_security(&server.pki)).await;
    assert_rejected(&server, &untrusted_security(&server)).await;

    // rejected handshakes leave the listener serving
    let rsp: String = client.unary("Echo/echo", &"still".to_string()).await.unwrap();
    assert_eq!(rsp, "still");
}

#[tokio::test]
async fn test_request_only() {
    let server = TestServer::start(ClientAuthPolicy::RequestOnly, default_chain()).await;

    let anonymous = connect(&server, &anonymous_security(&server.pki)).await.unwrap();
    let fingerprint: Option<String> = anonymous.unary("Echo/whoami", &()).await.unwrap();
    assert_eq!(fingerprint, None);

    let client = server.client().await;
    let fingerprint: Option<String> = client.unary("Echo/whoami", &()).await.unwrap();
    assert!(fingerprint.is_some());

    assert_rejected(&server, &untrusted_security(&server)).await;
}

#[tokio::test]
async fn test_no_client_auth() {
    let server = TestServer::start(ClientAuthPolicy::None, default_chain()).await;

    for security in [
        anonymous_security(&server.pki),
        untrusted_security(&server),
        common::client_security(&server.pki),
    ] {
        let client = connect(&server, &security).await.unwrap();
        let fingerprint: Option<String> = client.unary("Echo/whoami", &()).await.unwrap();
        assert_eq!(fingerprint, None);
    }
}

#[tokio::test]
async fn test_server_verification() {
    let server = TestServer::start(ClientAuthPolicy::RequireAndVerify, default_chain()).await;
    let pki = &server.pki;

    // the server certificate is not valid for this name
    let security = SecurityContext::client_from_pem(
        Some((pki.client_cert.as_bytes(), pki.client_key.as_bytes())),
        pki.ca.as_bytes(),
        "elsewhere.example",
    )
    .unwrap();
    let err = connect(&server, &security).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Handshake, "{err}");

    // the server certificate is not issued by a trusted CA
    let other = common::pki();
    let security = SecurityContext::client_from_pem(
        Some((pki.client_cert.as_bytes(), pki.client_key.as_bytes())),
        other.ca.as_bytes(),
        "localhost",
    )
    .unwrap();
    let err = connect(&server, &security).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Handshake, "{err}");
}

#[test]
fn test_invalid_credentials() {
    let pki = common::pki();

    let err = SecurityContext::server_from_pem(
        b"not a certificate",
        pki.server_key.as_bytes(),
        Some(pki.ca.as_bytes()),
        ClientAuthPolicy::RequireAndVerify,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Credential);

    let err = SecurityContext::server_from_pem(
        pki.server_cert.as_bytes(),
        pki.server_key.as_bytes(),
        None,
        ClientAuthPolicy::RequireAndVerify,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Credential);

    let err = SecurityContext::client_from_pem(None, b"", "localhost").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Credential);
}

#[tokio::test]
async fn test_wrong_context_side() {
    let pki = common::pki();
    let security = common::client_security(&pki);
    let server = Server::create(Router::default(), &InterceptorChain::new(), &ServerConfig::default());
    assert!(
        server
            .listen("127.0.0.1:0".parse().unwrap(), &security)
            .await
            .is_err()
    );

    let security = common::server_security(&pki, ClientAuthPolicy::None);
    let err = Client::connect("127.0.0.1:1".parse().unwrap(), &security, ClientConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}
