//! End-to-end scenarios: a real client and server wired together over
//! loopback sockets.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use burrow_client::Router;
use burrow_config::{
    AppConfig, EncryptorConfig, MappingConfig, Mode, Protocol, TlsConfig, WebSocketConfig,
};
use burrow_proto::MappingType;
use burrow_server::Switches;

const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

fn base_config(mode: Mode, tunnel_port: u16) -> AppConfig {
    AppConfig {
        mode,
        ip: LOCALHOST,
        port: tunnel_port,
        protocol: Protocol::Tcp,
        alignment: 4096,
        backlog: 128,
        fast_open: false,
        turbo_lan: false,
        turbo_wan: false,
        connect_timeout: Duration::from_secs(5),
        handshake_timeout: Duration::from_secs(5),
        inactive_timeout: Duration::from_secs(72),
        encryptor: EncryptorConfig::default(),
        tls: TlsConfig::default(),
        websocket: WebSocketConfig::default(),
        mappings: Vec::new(),
    }
}

/// Reserve a port that is currently free on loopback.
async fn free_port() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A TCP echo service on an ephemeral port.
async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

/// A UDP echo service on an ephemeral port.
async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    port
}

/// Connect to a public mapping port, retrying until the server has
/// installed the entry.
async fn connect_public(port: u16) -> TcpStream {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect((LOCALHOST, port)).await {
            Ok(stream) => return stream,
            Err(_) if tokio::time::Instant::now() < deadline => {
                sleep(Duration::from_millis(50)).await
            }
            Err(error) => panic!("public port {port} never opened: {error}"),
        }
    }
}

fn mapping(kind: MappingType, local_port: u16, remote_port: u16, concurrent: usize) -> MappingConfig {
    MappingConfig {
        name: "test".to_owned(),
        kind,
        local_ip: LOCALHOST,
        local_port,
        remote_port,
        concurrent,
        reconnect: Duration::from_secs(1),
    }
}

async fn start_pair(protocol: Protocol, mappings: Vec<MappingConfig>) -> (Arc<Switches>, Router) {
    let mut server_config = base_config(Mode::Server, 0);
    server_config.protocol = protocol;
    if protocol == Protocol::Encryptor {
        server_config.encryptor = EncryptorConfig {
            method: "aes-128-cfb".to_owned(),
            password: "secret".to_owned(),
        };
    }

    let switches = Switches::new(Arc::new(server_config));
    let tunnel_addr = switches.open().await.unwrap();

    let mut client_config = base_config(Mode::Client, tunnel_addr.port());
    client_config.protocol = protocol;
    if protocol == Protocol::Encryptor {
        client_config.encryptor = EncryptorConfig {
            method: "aes-128-cfb".to_owned(),
            password: "secret".to_owned(),
        };
    }
    client_config.mappings = mappings;

    let router = Router::new(Arc::new(client_config));
    router.open().unwrap();
    (switches, router)
}

#[tokio::test]
async fn tcp_echo_through_the_tunnel() {
    let echo_port = spawn_tcp_echo().await;
    let remote_port = free_port().await;
    let (switches, router) = start_pair(
        Protocol::Tcp,
        vec![mapping(MappingType::Tcp, echo_port, remote_port, 1)],
    )
    .await;

    let public = connect_public(remote_port).await;

    // A megabyte through the tunnel comes back byte-identical.
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        let (mut read_half, mut write_half) = public.into_split();
        let send = async {
            write_half.write_all(&payload).await.unwrap();
            write_half.flush().await.unwrap();
        };
        let recv = async {
            let mut echoed = vec![0u8; expected.len()];
            read_half.read_exact(&mut echoed).await.unwrap();
            echoed
        };
        let (_, echoed) = tokio::join!(send, recv);
        (expected, echoed)
    });

    let (expected, echoed) = timeout(Duration::from_secs(30), writer)
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, expected);

    router.close();
    switches.close();
}

#[tokio::test]
async fn encrypted_tunnel_carries_traffic() {
    let echo_port = spawn_tcp_echo().await;
    let remote_port = free_port().await;
    let (switches, router) = start_pair(
        Protocol::Encryptor,
        vec![mapping(MappingType::Tcp, echo_port, remote_port, 1)],
    )
    .await;

    let mut public = connect_public(remote_port).await;
    let payload = vec![0x5Au8; 1024];
    public.write_all(&payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), public.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, payload);

    router.close();
    switches.close();
}

#[tokio::test]
async fn concurrent_public_connections_share_the_mapping() {
    let echo_port = spawn_tcp_echo().await;
    let remote_port = free_port().await;
    let (switches, router) = start_pair(
        Protocol::Tcp,
        vec![mapping(MappingType::Tcp, echo_port, remote_port, 2)],
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let mut public = connect_public(remote_port).await;
        tasks.push(tokio::spawn(async move {
            let payload = vec![i; 4096];
            public.write_all(&payload).await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            public.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, payload);
        }));
    }
    for task in tasks {
        timeout(Duration::from_secs(10), task)
            .await
            .expect("connection timed out")
            .unwrap();
    }

    router.close();
    switches.close();
}

#[tokio::test]
async fn udp_datagrams_round_trip() {
    let echo_port = spawn_udp_echo().await;
    let remote_port = free_port().await;
    let (switches, router) = start_pair(
        Protocol::Tcp,
        vec![mapping(MappingType::Udp, echo_port, remote_port, 1)],
    )
    .await;

    let public = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    public.connect((LOCALHOST, remote_port)).await.unwrap();

    // The UDP entry appears once the client tunnel has handshaken;
    // retry the first datagram until a reply arrives.
    let mut reply = [0u8; 64];
    let n = timeout(Duration::from_secs(10), async {
        loop {
            let _ = public.send(b"ping").await;
            match timeout(Duration::from_millis(500), public.recv(&mut reply)).await {
                Ok(Ok(n)) => return n,
                _ => continue,
            }
        }
    })
    .await
    .expect("no UDP reply");
    assert_eq!(&reply[..n], b"ping");

    router.close();
    switches.close();
}

#[tokio::test]
async fn client_reconnects_after_initial_failure() {
    // The client comes up first, against a closed tunnel port; the
    // reconnect loop brings the mapping up once the server appears.
    let echo_port = spawn_tcp_echo().await;
    let remote_port = free_port().await;
    let tunnel_port = free_port().await;

    let mut client_config = base_config(Mode::Client, tunnel_port);
    client_config.mappings = vec![mapping(MappingType::Tcp, echo_port, remote_port, 1)];
    let router = Router::new(Arc::new(client_config));
    router.open().unwrap();

    // Let the first attempt fail.
    sleep(Duration::from_millis(300)).await;

    let server_config = base_config(Mode::Server, tunnel_port);
    let switches = Switches::new(Arc::new(server_config));
    switches.open().await.unwrap();

    let mut public = connect_public(remote_port).await;
    public.write_all(b"back online").await.unwrap();
    let mut echoed = [0u8; 11];
    timeout(Duration::from_secs(10), public.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"back online");

    router.close();
    switches.close();
}

#[tokio::test]
async fn closing_the_client_tears_down_public_flows() {
    let echo_port = spawn_tcp_echo().await;
    let remote_port = free_port().await;
    let (switches, router) = start_pair(
        Protocol::Tcp,
        vec![mapping(MappingType::Tcp, echo_port, remote_port, 1)],
    )
    .await;

    let mut public = connect_public(remote_port).await;
    public.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    timeout(Duration::from_secs(10), public.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();

    router.close();

    // The server notices the dead tunnel and ends the public flow.
    let n = timeout(Duration::from_secs(5), public.read(&mut echoed))
        .await
        .expect("public socket never closed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    switches.close();
}
