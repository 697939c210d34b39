//! TLS transport handshake against a throwaway self-signed certificate.

use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use burrow_config::{
    AppConfig, EncryptorConfig, Mode, Protocol, TlsConfig, WebSocketConfig,
};
use burrow_transport::Transmission;

fn write_temp(name: &str, contents: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("burrow-tls-test-{}-{name}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path
}

fn tls_config(mode: Mode, port: u16, tls: TlsConfig) -> AppConfig {
    AppConfig {
        mode,
        ip: IpAddr::from([127, 0, 0, 1]),
        port,
        protocol: Protocol::Tls,
        alignment: 4096,
        backlog: 128,
        fast_open: false,
        turbo_lan: false,
        turbo_wan: false,
        connect_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        inactive_timeout: Duration::from_secs(72),
        encryptor: EncryptorConfig::default(),
        tls,
        websocket: WebSocketConfig::default(),
        mappings: Vec::new(),
    }
}

#[tokio::test]
async fn tls_transport_round_trips_frames() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_path = write_temp("cert.pem", &certified.cert.pem());
    let key_path = write_temp("key.pem", &certified.key_pair.serialize_pem());

    let server_tls = TlsConfig {
        certificate_file: cert_path.display().to_string(),
        certificate_key_file: key_path.display().to_string(),
        ..TlsConfig::default()
    };
    let client_tls = TlsConfig {
        verify_peer: false,
        host: "localhost".to_owned(),
        ..TlsConfig::default()
    };

    let listener = TcpListener::bind((IpAddr::from([127, 0, 0, 1]), 0))
        .await
        .unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let server_config = Arc::new(tls_config(Mode::Server, addr.port(), server_tls));
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut transmission = Transmission::accept(&server_config, stream).await.unwrap();
        let frame = transmission.next().await.unwrap().unwrap();
        transmission.send(frame).await.unwrap();
    });

    let client_config = tls_config(Mode::Client, addr.port(), client_tls);
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut transmission = Transmission::connect(&client_config, stream).await.unwrap();

    transmission
        .send(bytes::Bytes::from_static(b"over tls"))
        .await
        .unwrap();
    let echoed = timeout(Duration::from_secs(5), transmission.next())
        .await
        .expect("no echo")
        .unwrap()
        .unwrap();
    assert_eq!(echoed, "over tls");

    server.await.unwrap();
    let _ = std::fs::remove_file(cert_path);
    let _ = std::fs::remove_file(key_path);
}
