#![allow(dead_code)]

use std::{net::SocketAddr, str::FromStr, time::Duration};

use mtrpc::*;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};

pub struct Pki {
    pub ca: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
}

fn new_ca() -> (Certificate, KeyPair) {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert, key)
}

fn issue(
    name: &str,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> (String, String) {
    let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
    params.extended_key_usages = vec![usage];
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, ca, ca_key).unwrap();
    (cert.pem(), key.serialize_pem())
}

pub fn pki() -> Pki {
    let (ca, ca_key) = new_ca();
    let (server_cert, server_key) =
        issue("localhost", ExtendedKeyUsagePurpose::ServerAuth, &ca, &ca_key);
    let (client_cert, client_key) =
        issue("client", ExtendedKeyUsagePurpose::ClientAuth, &ca, &ca_key);
    Pki {
        ca: ca.pem(),
        server_cert,
        server_key,
        client_cert,
        client_key,
    }
}

/// A client identity signed by a CA the server does not trust.
pub fn untrusted_identity() -> (String, String) {
    let (ca, ca_key) = new_ca();
    issue("mallory", ExtendedKeyUsagePurpose::ClientAuth, &ca, &ca_key)
}

pub fn server_security(pki: &Pki, policy: ClientAuthPolicy) -> SecurityContext {
    SecurityContext::server_from_pem(
        pki.server_cert.as_bytes(),
        pki.server_key.as_bytes(),
        Some(pki.ca.as_bytes()),
        policy,
    )
    .unwrap()
}

pub fn client_security(pki: &Pki) -> SecurityContext {
    SecurityContext::client_from_pem(
        Some((pki.client_cert.as_bytes(), pki.client_key.as_bytes())),
        pki.ca.as_bytes(),
        "localhost",
    )
    .unwrap()
}

pub fn anonymous_security(pki: &Pki) -> SecurityContext {
    SecurityContext::client_from_pem(None, pki.ca.as_bytes(), "localhost").unwrap()
}

/// Methods used across the integration tests.
pub fn router() -> Router {
    let mut router = Router::default();
    router
        .register(MethodDescriptor::unary(
            "Echo/echo",
            |_ctx, req: String| async move { Ok(req) },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::unary(
            "Echo/whoami",
            |ctx: Context, _req: ()| async move {
                Ok(ctx.peer().map(PeerIdentity::fingerprint))
            },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::unary(
            "Echo/panic",
            |_ctx, req: String| async move {
                if req == "boom" {
                    panic!("boom");
                }
                Ok(req)
            },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::unary(
            "Echo/sleep",
            |_ctx, millis: u64| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(millis)
            },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::unary(
            "Echo/fail",
            |_ctx, msg: String| async move { Err::<String, _>(Error::new(ErrorKind::InvalidArgument, msg)) },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::server_stream(
            "Stream/count",
            |_ctx, n: u32, sink: ResponseSink<u32>| async move {
                for i in 0..n {
                    sink.send(&i).await?;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Ok(())
            },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::server_stream(
            "Stream/panic",
            |_ctx, n: u32, sink: ResponseSink<u32>| async move {
                sink.send(&n).await?;
                if n > 0 {
                    panic!("stream handler failed after {n}");
                }
                Ok(())
            },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::client_stream(
            "Stream/sum",
            |_ctx, mut reqs: RequestStream<i64>| async move {
                let mut sum = 0;
                while let Some(v) = reqs.recv().await? {
                    sum += v;
                }
                Ok(sum)
            },
        ))
        .unwrap();
    router
        .register(MethodDescriptor::bidi_stream(
            "Stream/double",
            |_ctx, mut reqs: RequestStream<i64>, sink: ResponseSink<i64>| async move {
                while let Some(v) = reqs.recv().await? {
                    sink.send(&(v * 2)).await?;
                }
                Ok(())
            },
        ))
        .unwrap();
    router
}

pub struct TestServer {
    pub server: Server,
    pub addr: SocketAddr,
    pub pki: Pki,
}

impl TestServer {
    pub async fn start(policy: ClientAuthPolicy, chain: InterceptorChain) -> Self {
        let pki = pki();
        let server = Server::create(router(), &chain, &ServerConfig::default());
        let addr = SocketAddr::from_str("127.0.0.1:0").unwrap();
        let addr = server
            .listen(addr, &server_security(&pki, policy))
            .await
            .unwrap();
        Self {
            server,
            addr,
            pki,
        }
    }

    /// The single live server-side connection.
    pub fn connection(&self) -> Connection {
        let mut conns = self.server.connections();
        assert_eq!(conns.len(), 1);
        conns.remove(0)
    }

    /// Waits until the server has no call in flight.
    pub async fn wait_idle(&self) {
        let conn = self.connection();
        tokio::time::timeout(Duration::from_secs(2), async {
            while conn.active_calls() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    pub async fn client(&self) -> Client {
        self.client_with(ClientConfig::default()).await
    }

    pub async fn client_with(&self, config: ClientConfig) -> Client {
        Client::connect(self.addr, &client_security(&self.pki), config)
            .await
            .unwrap()
    }
}

pub fn default_chain() -> InterceptorChain {
    InterceptorChain::new()
        .with(RecoveryInterceptor)
        .with(LoggingInterceptor)
}
