//! Secure channel loopback using the real rustls engine and fixture
//! certificates.

use std::path::PathBuf;
use std::time::Duration;

use rustls::RootCertStore;

use coapstream_core::constants::CSM_CODE;
use coapstream_core::frame::encode_frame;
use coapstream_transport::testing::next_event_timeout;
use coapstream_transport::tls::{load_cert_chain, load_private_key};
use coapstream_transport::{Channel, ClientSecurity, PeerCredential, ServerSecurity, TransportEvent};

const WAIT: Duration = Duration::from_secs(5);

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn client_security() -> ClientSecurity {
    let mut roots = RootCertStore::empty();
    for cert in load_cert_chain(&fixture("server-cert.pem")).unwrap() {
        roots.add(cert).unwrap();
    }
    ClientSecurity::certificate(
        load_cert_chain(&fixture("server-cert.pem")).unwrap(),
        load_private_key(&fixture("server-key.pem")).unwrap(),
        roots,
    )
    .with_server_name("localhost")
}

fn server_security() -> ServerSecurity {
    ServerSecurity::new(
        load_cert_chain(&fixture("server-cert.pem")).unwrap(),
        load_private_key(&fixture("server-key.pem")).unwrap(),
    )
}

#[tokio::test]
async fn frames_flow_over_tls() {
    let server = Channel::tls_server("127.0.0.1:0".parse().unwrap(), server_security());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = Channel::tls_client(client_security());
    client.start().await.unwrap();

    client
        .send(addr, encode_frame(0x02, &[0x01], b"secret ping").unwrap())
        .await
        .unwrap();

    let mut saw_csm = false;
    loop {
        match next_event_timeout(&server, WAIT).await {
            Some(TransportEvent::FrameReceived { frame, .. }) => {
                if frame.code() == CSM_CODE {
                    saw_csm = true;
                    continue;
                }
                assert_eq!(frame.payload(), b"secret ping");
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_csm);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn client_session_carries_the_server_certificate() {
    let server = Channel::tls_server("127.0.0.1:0".parse().unwrap(), server_security());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = Channel::tls_client(client_security());
    client.start().await.unwrap();

    let session = client.connect(addr).await.unwrap();
    let expected = load_cert_chain(&fixture("server-cert.pem")).unwrap()[0]
        .as_ref()
        .to_vec();
    assert_eq!(
        session.peer_credential(),
        Some(PeerCredential::Certificate(expected))
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn untrusting_client_fails_the_handshake() {
    let server = Channel::tls_server("127.0.0.1:0".parse().unwrap(), server_security());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // Empty root store: the server certificate cannot validate.
    let security = ClientSecurity::certificate(
        load_cert_chain(&fixture("server-cert.pem")).unwrap(),
        load_private_key(&fixture("server-key.pem")).unwrap(),
        RootCertStore::empty(),
    )
    .with_server_name("localhost");
    let client = Channel::tls_client(security);
    client.start().await.unwrap();

    assert!(client.connect(addr).await.is_err());
    assert_eq!(client.session_count().await, 0);

    client.stop().await;
    server.stop().await;
}
