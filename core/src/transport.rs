//! Authenticated transport (component C): TCP connect/accept, the
//! HELLO/CHALLENGE/RESPONSE/OK handshake, and AEAD wrap/unwrap of every
//! frame once the handshake completes.

use crate::crypto::{self, NonceCounter, SessionKeys};
use crate::error::{Error, Result};
use crate::pairing::PairingRecord;
use crate::protocol::{self, Message, MAX_FRAME_SIZE};
use async_trait::async_trait;
use base64::Engine;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

/// Post-handshake connection: one authenticated session, carrying typed
/// messages with a binary payload.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, msg: &Message, payload: &[u8]) -> Result<()>;
    async fn recv(&self) -> Result<(Message, Vec<u8>)>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    type Conn: Connection;
    async fn connect(&self, addr: SocketAddr, my_device_id: &str, pairing: &PairingRecord) -> Result<Self::Conn>;
}

#[async_trait]
pub trait Listener: Send + Sync {
    type Conn: Connection;
    /// Accepts and authenticates one inbound connection.
    async fn accept(&self, my_device_id: &str, pairing: &PairingRecord) -> Result<Self::Conn>;
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn unb64<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| Error::ProtocolError(format!("bad base64 in handshake: {e}")))?;
    bytes.try_into().map_err(|_| Error::ProtocolError(format!("expected {N} bytes in handshake field")))
}

async fn write_plain(stream: &mut TcpStream, msg: &Message) -> Result<()> {
    let bytes = protocol::encode_plain_frame(msg, b"")?;
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn read_plain(stream: &mut TcpStream) -> Result<Message> {
    let total_len = stream.read_u32().await.map_err(|_| Error::AuthError("handshake stream closed".into()))?;
    if total_len > MAX_FRAME_SIZE {
        return Err(Error::ProtocolError("handshake frame exceeds MAX_FRAME_SIZE".into()));
    }
    let mut body = vec![0u8; total_len as usize];
    stream.read_exact(&mut body).await.map_err(|_| Error::AuthError("handshake stream closed".into()))?;
    let (msg, _payload) = protocol::decode_plain_frame(&body)?;
    Ok(msg)
}

/// Runs the connector side of the handshake (step 1 and 3) and returns the
/// resulting authenticated connection.
pub async fn run_client_handshake(mut stream: TcpStream, my_device_id: &str, pairing: &PairingRecord) -> Result<AuthenticatedConnection> {
    let nonce_c = crypto::random_bytes::<16>();
    write_plain(&mut stream, &Message::HandshakeHello { nonce_c: b64(&nonce_c), device_id: my_device_id.to_string() }).await?;

    let Message::HandshakeChallenge { nonce_s, challenge } = read_plain(&mut stream).await? else {
        return Err(Error::AuthError("expected HANDSHAKE_CHALLENGE".into()));
    };
    let nonce_s: [u8; 16] = unb64(&nonce_s)?;
    let challenge: [u8; 32] = unb64(&challenge)?;

    let mac = crypto::challenge_mac(&pairing.shared_secret, &challenge, &nonce_c, &nonce_s);
    write_plain(&mut stream, &Message::HandshakeResponse { mac: b64(&mac) }).await?;

    match read_plain(&mut stream).await? {
        Message::HandshakeOk => {}
        _ => return Err(Error::AuthError("handshake rejected by peer".into())),
    }

    let keys = SessionKeys::derive(&pairing.shared_secret, &nonce_c, &nonce_s);
    Ok(AuthenticatedConnection::new(stream, keys.key_c2s, keys.key_s2c))
}

/// Runs the acceptor side of the handshake (step 2 and 4).
pub async fn run_server_handshake(mut stream: TcpStream, my_device_id: &str, pairing: &PairingRecord) -> Result<AuthenticatedConnection> {
    let _ = my_device_id;
    let Message::HandshakeHello { nonce_c, device_id: _ } = read_plain(&mut stream).await? else {
        return Err(Error::AuthError("expected HANDSHAKE_HELLO".into()));
    };
    let nonce_c: [u8; 16] = unb64(&nonce_c)?;

    let nonce_s = crypto::random_bytes::<16>();
    let challenge = crypto::random_bytes::<32>();
    write_plain(&mut stream, &Message::HandshakeChallenge { nonce_s: b64(&nonce_s), challenge: b64(&challenge) }).await?;

    let Message::HandshakeResponse { mac } = read_plain(&mut stream).await? else {
        return Err(Error::AuthError("expected HANDSHAKE_RESPONSE".into()));
    };
    let mac: Vec<u8> = base64::engine::general_purpose::STANDARD
        .decode(&mac)
        .map_err(|e| Error::ProtocolError(format!("bad base64 mac: {e}")))?;
    if !crypto::verify_challenge_mac(&pairing.shared_secret, &challenge, &nonce_c, &nonce_s, &mac) {
        return Err(Error::AuthError("handshake MAC mismatch".into()));
    }

    write_plain(&mut stream, &Message::HandshakeOk).await?;

    let keys = SessionKeys::derive(&pairing.shared_secret, &nonce_c, &nonce_s);
    Ok(AuthenticatedConnection::new(stream, keys.key_s2c, keys.key_c2s))
}

/// A TCP stream past the handshake, sealing/opening every frame with its
/// direction's key and a strictly-monotone nonce counter.
pub struct AuthenticatedConnection {
    write_half: Mutex<OwnedWriteHalf>,
    read_half: Mutex<OwnedReadHalf>,
    send_key: [u8; 32],
    send_counter: Mutex<NonceCounter>,
    recv_key: [u8; 32],
    recv_counter: Mutex<NonceCounter>,
    closed: AtomicBool,
}

impl AuthenticatedConnection {
    fn new(stream: TcpStream, send_key: [u8; 32], recv_key: [u8; 32]) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            write_half: Mutex::new(write_half),
            read_half: Mutex::new(read_half),
            send_key,
            send_counter: Mutex::new(NonceCounter::new()),
            recv_key,
            recv_counter: Mutex::new(NonceCounter::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Connection for AuthenticatedConnection {
    async fn send(&self, msg: &Message, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }
        let plaintext = protocol::encode_inner(msg, payload)?;
        let nonce = {
            let mut counter = self.send_counter.lock().await;
            counter.next()?
        };
        let ciphertext = crypto::seal(&self.send_key, &nonce, &plaintext)?;
        if ciphertext.len() as u32 > MAX_FRAME_SIZE {
            return Err(Error::ProtocolError("sealed frame exceeds MAX_FRAME_SIZE".into()));
        }
        let mut write_half = self.write_half.lock().await;
        write_half.write_u32(ciphertext.len() as u32).await.map_err(|_| Error::ConnectionLost)?;
        write_half.write_all(&ciphertext).await.map_err(|_| Error::ConnectionLost)?;
        Ok(())
    }

    async fn recv(&self) -> Result<(Message, Vec<u8>)> {
        let mut read_half = self.read_half.lock().await;
        let cipher_len = read_half.read_u32().await.map_err(|_| Error::ConnectionLost)?;
        if cipher_len > MAX_FRAME_SIZE {
            return Err(Error::ProtocolError("incoming frame exceeds MAX_FRAME_SIZE".into()));
        }
        let mut ciphertext = vec![0u8; cipher_len as usize];
        read_half.read_exact(&mut ciphertext).await.map_err(|_| Error::ConnectionLost)?;
        drop(read_half);
        let nonce = {
            let mut counter = self.recv_counter.lock().await;
            counter.next()?
        };
        let plaintext = crypto::open(&self.recv_key, &nonce, &ciphertext)?;
        protocol::decode_inner(&plaintext)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// TCP transport: one socket per dial, handshake run inline.
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    type Conn = AuthenticatedConnection;

    async fn connect(&self, addr: SocketAddr, my_device_id: &str, pairing: &PairingRecord) -> Result<Self::Conn> {
        let stream = TcpStream::connect(addr).await?;
        run_client_handshake(stream, my_device_id, pairing).await
    }
}

/// TCP listener bound to the service port (9876 by default).
pub struct TcpListener {
    inner: TokioTcpListener,
}

impl TcpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Ok(Self { inner: TokioTcpListener::bind(addr).await? })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Conn = AuthenticatedConnection;

    async fn accept(&self, my_device_id: &str, pairing: &PairingRecord) -> Result<Self::Conn> {
        let (stream, _peer_addr) = self.inner.accept().await?;
        run_server_handshake(stream, my_device_id, pairing).await
    }
}

// --- In-memory test doubles -------------------------------------------

/// Creates a connected pair of in-memory connections, unencrypted, for
/// agent-level tests that don't need real sockets.
pub fn memory_connection_pair() -> (MemoryConnection, MemoryConnection) {
    let (tx_a, rx_a) = mpsc::channel::<(Message, Vec<u8>)>(64);
    let (tx_b, rx_b) = mpsc::channel::<(Message, Vec<u8>)>(64);
    let a = MemoryConnection { tx: tx_a, rx: Arc::new(Mutex::new(rx_b)), closed: Arc::new(AtomicBool::new(false)) };
    let b = MemoryConnection { tx: tx_b, rx: Arc::new(Mutex::new(rx_a)), closed: Arc::new(AtomicBool::new(false)) };
    (a, b)
}

pub struct MemoryConnection {
    tx: mpsc::Sender<(Message, Vec<u8>)>,
    rx: Arc<Mutex<mpsc::Receiver<(Message, Vec<u8>)>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, msg: &Message, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionLost);
        }
        self.tx.send((msg.clone(), payload.to_vec())).await.map_err(|_| Error::ConnectionLost)
    }

    async fn recv(&self) -> Result<(Message, Vec<u8>)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(Error::ConnectionLost)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct MemoryListener {
    rx: Arc<Mutex<mpsc::Receiver<MemoryConnection>>>,
}

impl MemoryListener {
    pub fn new(rx: mpsc::Receiver<MemoryConnection>) -> Self {
        Self { rx: Arc::new(Mutex::new(rx)) }
    }
}

#[async_trait]
impl Listener for MemoryListener {
    type Conn = MemoryConnection;
    async fn accept(&self, _my_device_id: &str, _pairing: &PairingRecord) -> Result<MemoryConnection> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(Error::ConnectionLost)
    }
}

pub fn memory_transport_pair() -> (mpsc::Sender<MemoryConnection>, MemoryListener) {
    let (tx, rx) = mpsc::channel::<MemoryConnection>(16);
    (tx, MemoryListener::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_pairing() -> PairingRecord {
        PairingRecord {
            device_id: "host".into(),
            peer_device_id: "joiner".into(),
            peer_name: String::new(),
            shared_secret: [42u8; 32],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn tcp_handshake_then_send_recv() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pairing = test_pairing();
        let pairing_server = pairing.clone();

        let server = tokio::spawn(async move {
            let conn = listener.accept("host", &pairing_server).await.unwrap();
            let (msg, payload) = conn.recv().await.unwrap();
            conn.send(&msg, &payload).await.unwrap();
        });

        let client = TcpTransport.connect(addr, "joiner", &pairing).await.unwrap();
        client.send(&Message::Text { content: "hi".into() }, b"").await.unwrap();
        let (msg, _) = client.recv().await.unwrap();
        assert_eq!(msg, Message::Text { content: "hi".into() });
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_shared_secret_fails_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_pairing = test_pairing();
        let mut client_pairing = test_pairing();
        client_pairing.shared_secret = [7u8; 32];

        let server = tokio::spawn(async move { listener.accept("host", &server_pairing).await });

        let result = TcpTransport.connect(addr, "joiner", &client_pairing).await;
        assert!(result.is_err());
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn memory_connection_send_recv() {
        let (a, b) = memory_connection_pair();
        a.send(&Message::Heartbeat, b"").await.unwrap();
        let (msg, _) = b.recv().await.unwrap();
        assert_eq!(msg, Message::Heartbeat);
    }

    #[tokio::test]
    async fn memory_connection_close_rejects_send() {
        let (a, _b) = memory_connection_pair();
        a.close();
        assert!(a.is_closed());
        assert!(a.send(&Message::Heartbeat, b"").await.is_err());
    }
}
