//! The transport variants behind a tunnel.
//!
//! A [`Transmission`] is a bidirectional, message-oriented channel: a
//! `Stream` of inbound frame payloads and a `Sink` of outbound ones.
//! The variant is fixed by the configured protocol during the handshake
//! constructors; after that every variant behaves identically to its
//! callers.

use bytes::{Buf, Bytes, BytesMut};
use futures::{Sink, Stream};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use burrow_config::{AppConfig, Protocol, WebSocketConfig};

use crate::crypto::{Decryptor, Encryptor, Method};
use crate::{framing, tls, BoxedIo, TransportError, MAX_FRAME_LEN};

/// One tunnel's transport, after a successful handshake.
pub struct Transmission {
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    kind: Kind,
}

enum Kind {
    /// Length-framed byte stream: plain TCP, or TLS once established.
    Stream(Framed<BoxedIo, LengthDelimitedCodec>),
    /// Length-framed byte stream where every payload is ciphertext.
    Encrypted {
        io: Framed<BoxedIo, LengthDelimitedCodec>,
        seal: Encryptor,
        open: Decryptor,
    },
    /// Binary WebSocket messages carrying framed payloads. Frames may be
    /// split across or coalesced within messages, so inbound bytes are
    /// buffered and re-framed here.
    WebSocket {
        ws: WebSocketStream<BoxedIo>,
        recv: BytesMut,
        pending: VecDeque<Bytes>,
    },
}

impl Transmission {
    /// Client-role handshake over a connected socket.
    pub async fn connect(config: &AppConfig, stream: TcpStream) -> Result<Self, TransportError> {
        let (local_addr, peer_addr) = endpoints(&stream);
        let kind = match config.protocol {
            Protocol::Tcp => Kind::Stream(framing::framed(Box::new(stream))),
            Protocol::Ssl | Protocol::Tls => {
                let connector = tls::client_connector(&config.tls)?;
                let name = tls::server_name(&config.tls)?;
                let tls_stream = connector.connect(name, stream).await?;
                Kind::Stream(framing::framed(Box::new(tls_stream)))
            }
            Protocol::Encryptor => {
                let (seal, open) = cipher_pair(config)?;
                Kind::Encrypted {
                    io: framing::framed(Box::new(stream)),
                    seal,
                    open,
                }
            }
            Protocol::WebSocket => websocket(ws_connect(&config.websocket, Box::new(stream)).await?),
            Protocol::WebSocketSsl | Protocol::WebSocketTls => {
                let connector = tls::client_connector(&config.tls)?;
                let name = ws_server_name(config)?;
                let tls_stream = connector.connect(name, stream).await?;
                websocket(ws_connect(&config.websocket, Box::new(tls_stream)).await?)
            }
        };
        Ok(Self {
            local_addr,
            peer_addr,
            kind,
        })
    }

    /// Server-role handshake over an accepted socket.
    pub async fn accept(config: &AppConfig, stream: TcpStream) -> Result<Self, TransportError> {
        let (local_addr, peer_addr) = endpoints(&stream);
        let kind = match config.protocol {
            Protocol::Tcp => Kind::Stream(framing::framed(Box::new(stream))),
            Protocol::Ssl | Protocol::Tls => {
                let acceptor = tls::server_acceptor(&config.tls)?;
                let tls_stream = acceptor.accept(stream).await?;
                Kind::Stream(framing::framed(Box::new(tls_stream)))
            }
            Protocol::Encryptor => {
                let (seal, open) = cipher_pair(config)?;
                Kind::Encrypted {
                    io: framing::framed(Box::new(stream)),
                    seal,
                    open,
                }
            }
            Protocol::WebSocket => websocket(ws_accept(&config.websocket, Box::new(stream)).await?),
            Protocol::WebSocketSsl | Protocol::WebSocketTls => {
                let acceptor = tls::server_acceptor(&config.tls)?;
                let tls_stream = acceptor.accept(stream).await?;
                websocket(ws_accept(&config.websocket, Box::new(tls_stream)).await?)
            }
        };
        Ok(Self {
            local_addr,
            peer_addr,
            kind,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Plain length-framed transport over an already-established byte
    /// stream, with no handshake of its own.
    pub fn from_io(io: BoxedIo) -> Self {
        Self {
            local_addr: None,
            peer_addr: None,
            kind: Kind::Stream(framing::framed(io)),
        }
    }

    #[cfg(test)]
    pub(crate) fn plain(io: tokio::io::DuplexStream) -> Self {
        Self::from_io(Box::new(io))
    }
}

fn endpoints(stream: &TcpStream) -> (Option<SocketAddr>, Option<SocketAddr>) {
    (stream.local_addr().ok(), stream.peer_addr().ok())
}

fn websocket(ws: WebSocketStream<BoxedIo>) -> Kind {
    Kind::WebSocket {
        ws,
        recv: BytesMut::new(),
        pending: VecDeque::new(),
    }
}

fn cipher_pair(config: &AppConfig) -> Result<(Encryptor, Decryptor), TransportError> {
    let method = Method::from_name(&config.encryptor.method).ok_or_else(|| {
        TransportError::Cipher(format!(
            "unsupported cipher method {:?}",
            config.encryptor.method
        ))
    })?;
    Ok((
        Encryptor::new(method, &config.encryptor.password),
        Decryptor::new(method, &config.encryptor.password),
    ))
}

/// TLS server name for the WebSocket-over-TLS client: the TLS host when
/// peer verification is configured, else the upgrade host.
fn ws_server_name(
    config: &AppConfig,
) -> Result<rustls::pki_types::ServerName<'static>, TransportError> {
    let host = if config.tls.verify_peer && !config.tls.host.is_empty() {
        &config.tls.host
    } else {
        &config.websocket.host
    };
    rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| TransportError::Tls(format!("invalid TLS host {host:?}")))
}

async fn ws_connect(
    ws: &WebSocketConfig,
    io: BoxedIo,
) -> Result<WebSocketStream<BoxedIo>, TransportError> {
    let request = format!("ws://{}{}", ws.host, ws.path).into_client_request()?;
    let (stream, _response) = tokio_tungstenite::client_async(request, io).await?;
    Ok(stream)
}

async fn ws_accept(
    ws: &WebSocketConfig,
    io: BoxedIo,
) -> Result<WebSocketStream<BoxedIo>, TransportError> {
    let expected = ws.path.clone();
    let callback = move |request: &Request, response: Response| {
        if request.uri().path() == expected {
            Ok(response)
        } else {
            debug!(path = %request.uri().path(), "rejecting upgrade for unknown path");
            let mut refusal = ErrorResponse::new(None);
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };
    Ok(tokio_tungstenite::accept_hdr_async(io, callback).await?)
}

/// Split buffered WebSocket bytes into complete frames.
fn drain_frames(recv: &mut BytesMut, pending: &mut VecDeque<Bytes>) -> Result<(), TransportError> {
    while recv.len() >= 2 {
        let len = u16::from_be_bytes([recv[0], recv[1]]) as usize;
        if len == 0 {
            return Err(TransportError::Protocol("zero-length frame".into()));
        }
        if recv.len() < 2 + len {
            break;
        }
        recv.advance(2);
        pending.push_back(recv.split_to(len).freeze());
    }
    Ok(())
}

impl Stream for Transmission {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().kind {
            Kind::Stream(io) => match ready!(Pin::new(io).poll_next(cx)) {
                Some(Ok(frame)) if frame.is_empty() => {
                    Poll::Ready(Some(Err(TransportError::Protocol("zero-length frame".into()))))
                }
                Some(Ok(frame)) => Poll::Ready(Some(Ok(frame.freeze()))),
                Some(Err(error)) => Poll::Ready(Some(Err(error.into()))),
                None => Poll::Ready(None),
            },
            Kind::Encrypted { io, open, .. } => match ready!(Pin::new(io).poll_next(cx)) {
                Some(Ok(frame)) if frame.is_empty() => {
                    Poll::Ready(Some(Err(TransportError::Protocol("zero-length frame".into()))))
                }
                Some(Ok(frame)) => Poll::Ready(Some(open.decrypt(&frame))),
                Some(Err(error)) => Poll::Ready(Some(Err(error.into()))),
                None => Poll::Ready(None),
            },
            Kind::WebSocket { ws, recv, pending } => loop {
                if let Some(frame) = pending.pop_front() {
                    return Poll::Ready(Some(Ok(frame)));
                }
                match ready!(Pin::new(&mut *ws).poll_next(cx)) {
                    Some(Ok(Message::Binary(data))) => {
                        recv.extend_from_slice(&data);
                        if let Err(error) = drain_frames(recv, pending) {
                            return Poll::Ready(Some(Err(error)));
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        return Poll::Ready(Some(Err(TransportError::Protocol(
                            "unexpected text message".into(),
                        ))))
                    }
                    Some(Ok(Message::Close(_))) | None => return Poll::Ready(None),
                    Some(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                }
            },
        }
    }
}

impl Sink<Bytes> for Transmission {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &mut self.get_mut().kind {
            Kind::Stream(io) | Kind::Encrypted { io, .. } => {
                Pin::new(io).poll_ready(cx).map_err(Into::into)
            }
            Kind::WebSocket { ws, .. } => Pin::new(ws).poll_ready(cx).map_err(Into::into),
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        if item.is_empty() || item.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameSize(item.len()));
        }
        match &mut self.get_mut().kind {
            Kind::Stream(io) => Pin::new(io).start_send(item).map_err(Into::into),
            Kind::Encrypted { io, seal, .. } => {
                let sealed = seal.encrypt(&item)?;
                if sealed.len() > MAX_FRAME_LEN {
                    return Err(TransportError::FrameSize(sealed.len()));
                }
                Pin::new(io).start_send(sealed).map_err(Into::into)
            }
            Kind::WebSocket { ws, .. } => {
                let mut message = Vec::with_capacity(2 + item.len());
                message.extend_from_slice(&(item.len() as u16).to_be_bytes());
                message.extend_from_slice(&item);
                Pin::new(ws)
                    .start_send(Message::binary(message))
                    .map_err(Into::into)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &mut self.get_mut().kind {
            Kind::Stream(io) | Kind::Encrypted { io, .. } => {
                Pin::new(io).poll_flush(cx).map_err(Into::into)
            }
            Kind::WebSocket { ws, .. } => Pin::new(ws).poll_flush(cx).map_err(Into::into),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &mut self.get_mut().kind {
            Kind::Stream(io) | Kind::Encrypted { io, .. } => {
                Pin::new(io).poll_close(cx).map_err(Into::into)
            }
            Kind::WebSocket { ws, .. } => Pin::new(ws).poll_close(cx).map_err(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;

    fn encrypted(io: tokio::io::DuplexStream, password: &str) -> Transmission {
        Transmission {
            local_addr: None,
            peer_addr: None,
            kind: Kind::Encrypted {
                io: framing::framed(Box::new(io)),
                seal: Encryptor::new(Method::Aes128Cfb, password),
                open: Decryptor::new(Method::Aes128Cfb, password),
            },
        }
    }

    async fn ws_pair() -> (Transmission, Transmission) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let config = WebSocketConfig {
            host: "tunnel.example.com".to_owned(),
            path: "/tunnel".to_owned(),
        };
        let server_config = config.clone();
        let server = tokio::spawn(async move {
            ws_accept(&server_config, Box::new(server_io) as BoxedIo).await
        });
        let client = ws_connect(&config, Box::new(client_io) as BoxedIo)
            .await
            .unwrap();
        let server = server.await.unwrap().unwrap();

        let wrap = |ws| Transmission {
            local_addr: None,
            peer_addr: None,
            kind: websocket(ws),
        };
        (wrap(client), wrap(server))
    }

    #[tokio::test]
    async fn plain_frames_round_trip() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut near = Transmission::plain(a);
        let mut far = Transmission::plain(b);

        near.send(Bytes::from_static(b"one")).await.unwrap();
        near.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(far.next().await.unwrap().unwrap(), "one");
        assert_eq!(far.next().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn zero_length_frame_is_fatal() {
        let (mut raw, b) = tokio::io::duplex(64);
        let mut far = Transmission::plain(b);

        raw.write_all(&[0, 0]).await.unwrap();
        assert!(matches!(
            far.next().await,
            Some(Err(TransportError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn empty_payload_is_refused_on_send() {
        let (a, _b) = tokio::io::duplex(64);
        let mut near = Transmission::plain(a);
        assert!(matches!(
            near.send(Bytes::new()).await,
            Err(TransportError::FrameSize(0))
        ));
    }

    #[tokio::test]
    async fn encrypted_frames_round_trip_without_plaintext_on_the_wire() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut near = encrypted(a, "secret");
        let mut far = encrypted(b, "secret");

        let payload = Bytes::from(vec![0x42; 1024]);
        near.send(payload.clone()).await.unwrap();
        near.send(Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(far.next().await.unwrap().unwrap(), payload);
        assert_eq!(far.next().await.unwrap().unwrap(), "second");
    }

    #[tokio::test]
    async fn encrypted_first_frame_carries_the_iv() {
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let mut near = encrypted(a, "secret");
        near.send(Bytes::from_static(b"hello")).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut wire = [0u8; 2 + 16 + 5];
        raw.read_exact(&mut wire).await.unwrap();
        // Length prefix describes the ciphertext: IV plus payload.
        assert_eq!(u16::from_be_bytes([wire[0], wire[1]]) as usize, 16 + 5);
        assert!(!wire.windows(5).any(|w| w == b"hello"));
    }

    #[tokio::test]
    async fn websocket_messages_carry_frames() {
        let (mut client, mut server) = ws_pair().await;

        client.send(Bytes::from_static(b"ping me")).await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), "ping me");

        server.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), "pong");
    }

    #[tokio::test]
    async fn websocket_upgrade_rejects_wrong_path() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            ws_accept(
                &WebSocketConfig {
                    host: "tunnel.example.com".to_owned(),
                    path: "/tunnel".to_owned(),
                },
                Box::new(server_io) as BoxedIo,
            )
            .await
        });
        let client = ws_connect(
            &WebSocketConfig {
                host: "tunnel.example.com".to_owned(),
                path: "/elsewhere".to_owned(),
            },
            Box::new(client_io) as BoxedIo,
        )
        .await;

        assert!(client.is_err());
        assert!(server.await.unwrap().is_err());
    }

    #[test]
    fn split_frames_reassemble_across_chunks() {
        let mut recv = BytesMut::new();
        let mut pending = VecDeque::new();

        recv.extend_from_slice(&[0, 3, b'a']);
        drain_frames(&mut recv, &mut pending).unwrap();
        assert!(pending.is_empty());

        recv.extend_from_slice(&[b'b', b'c', 0, 1, b'z']);
        drain_frames(&mut recv, &mut pending).unwrap();
        assert_eq!(pending.pop_front().unwrap(), "abc");
        assert_eq!(pending.pop_front().unwrap(), "z");
    }
}
