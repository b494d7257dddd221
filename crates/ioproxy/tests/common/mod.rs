//! Test utilities: fake upstream servers and a recording messaging client.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ioproxy::{ConnectOptions, MessagingClient, TunnelResult};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};

/// A request as seen by a fake upstream.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub host: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Number of frames the fake upstream splits its echoed body into.
pub const ECHO_CHUNKS: usize = 3;

/// Reserve a loopback port that is free right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    listener.local_addr().expect("probe addr").port()
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn split_chunks(body: &Bytes, parts: usize) -> Vec<Bytes> {
    if body.is_empty() {
        return Vec::new();
    }
    let size = body.len().div_ceil(parts);
    body.chunks(size).map(Bytes::copy_from_slice).collect()
}

/// Plain HTTP server that records each request and answers `201 Created`
/// with `x-upstream: fake`, echoing the request body in several frames.
pub async fn spawn_http_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<RecordedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake upstream");
    let addr = listener.local_addr().expect("fake upstream addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await?.to_bytes();
                        let host = parts
                            .headers
                            .get(HOST)
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_string);
                        let _ = tx.send(RecordedRequest {
                            method: parts.method.clone(),
                            uri: parts.uri.to_string(),
                            host,
                            headers: parts.headers.clone(),
                            body: body.clone(),
                        });

                        let frames: Vec<Result<Frame<Bytes>, Infallible>> =
                            split_chunks(&body, ECHO_CHUNKS)
                                .into_iter()
                                .map(|chunk| Ok(Frame::data(chunk)))
                                .collect();
                        let response = Response::builder()
                            .status(StatusCode::CREATED)
                            .header("x-upstream", "fake")
                            .body(StreamBody::new(futures::stream::iter(frames)))
                            .expect("build fake response");
                        Ok::<_, hyper::Error>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, rx)
}

/// What a fake WebSocket upstream saw during the handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub uri: String,
    pub host: Option<String>,
}

/// WebSocket server that echoes text and binary messages.
pub async fn spawn_ws_echo_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Handshake>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake ws upstream");
    let addr = listener.local_addr().expect("fake ws upstream addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let callback = move |req: &WsRequest, resp: WsResponse| {
                    let _ = tx.send(Handshake {
                        uri: req.uri().to_string(),
                        host: req
                            .headers()
                            .get("host")
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_string),
                    });
                    Ok::<WsResponse, ErrorResponse>(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    if message.is_close() {
                        break;
                    }
                    if (message.is_text() || message.is_binary()) && ws.send(message).await.is_err()
                    {
                        break;
                    }
                }
            });
        }
    });

    (addr, rx)
}

/// TCP server that captures the opening bytes of each connection and then
/// hangs up without answering.
///
/// Capture stops after a complete TLS record or the end of an HTTP header
/// block, whichever the peer sends.
pub async fn spawn_raw_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind raw upstream");
    let addr = listener.local_addr().expect("raw upstream addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut captured = Vec::new();
                let mut buf = [0u8; 4096];
                while !preamble_complete(&captured) {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => captured.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(captured);
            });
        }
    });

    (addr, rx)
}

fn preamble_complete(bytes: &[u8]) -> bool {
    if bytes.len() >= 5 && bytes[0] == 0x16 {
        let record_len = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        return bytes.len() >= 5 + record_len;
    }
    bytes.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Send one request to `addr` over a fresh HTTP/1.1 connection.
pub async fn send_request<B>(addr: SocketAddr, request: Request<B>) -> Response<Incoming>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = TcpStream::connect(addr).await.expect("connect to relay");
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("client handshake");
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
        .send_request(request)
        .await
        .expect("send request to relay")
}

/// GET `path_and_query` on the relay with an empty body.
pub async fn relay_get(addr: SocketAddr, path_and_query: &str) -> Response<Incoming> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(path_and_query)
        .header(HOST, addr.to_string())
        .body(http_body_util::Empty::<Bytes>::new())
        .expect("build relay request");
    send_request(addr, request).await
}

pub async fn body_bytes(response: Response<Incoming>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
}

/// A connect call captured by [`RecordingClient`].
#[derive(Debug, Clone)]
pub struct RecordedConnect {
    pub url: String,
    pub options: ConnectOptions,
}

/// Messaging client that records what it was asked to connect to.
#[derive(Debug, Default)]
pub struct RecordingClient;

#[async_trait]
impl MessagingClient for RecordingClient {
    type Connection = RecordedConnect;

    async fn connect(&self, url: &str, options: ConnectOptions) -> TunnelResult<RecordedConnect> {
        Ok(RecordedConnect {
            url: url.to_string(),
            options,
        })
    }
}
