use {
    super::errors::{NetIOError, NetIOErrorValue},
    bytes::{BufMut, Bytes, BytesMut},
    futures::{SinkExt, StreamExt},
    std::{fs::File, io::BufReader, net::SocketAddr, sync::Arc, time::Duration},
    tokio::net::{TcpStream, UdpSocket},
    tokio_rustls::{
        rustls::{self, Certificate, PrivateKey},
        server::TlsStream,
        TlsAcceptor,
    },
    tokio_util::codec::{BytesCodec, Framed},
};

pub enum NetType {
    Tcp,
    Udp,
}

/// One duplex network endpoint, protocol sessions own exactly one.
#[async_trait::async_trait]
pub trait TNetIO: Send + Sync {
    async fn write(&mut self, bytes: Bytes) -> Result<(), NetIOError>;
    async fn read(&mut self) -> Result<BytesMut, NetIOError>;
    async fn read_timeout(&mut self, duration: Duration) -> Result<BytesMut, NetIOError>;
    fn net_type(&self) -> NetType;
}

pub struct TcpIO {
    stream: Framed<TcpStream, BytesCodec>,
}

impl TcpIO {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Framed::new(stream, BytesCodec::new()),
        }
    }
}

#[async_trait::async_trait]
impl TNetIO for TcpIO {
    fn net_type(&self) -> NetType {
        NetType::Tcp
    }

    async fn write(&mut self, bytes: Bytes) -> Result<(), NetIOError> {
        self.stream.send(bytes).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<BytesMut, NetIOError> {
        match self.stream.next().await {
            Some(Ok(data)) => Ok(data),
            Some(Err(err)) => Err(NetIOError {
                value: NetIOErrorValue::IO(err),
            }),
            None => Err(NetIOError {
                value: NetIOErrorValue::Closed,
            }),
        }
    }

    async fn read_timeout(&mut self, duration: Duration) -> Result<BytesMut, NetIOError> {
        tokio::time::timeout(duration, self.read()).await?
    }
}

pub struct TlsIO {
    stream: Framed<TlsStream<TcpStream>, BytesCodec>,
}

impl TlsIO {
    pub async fn handshake(
        stream: TcpStream,
        acceptor: TlsAcceptor,
    ) -> Result<Self, NetIOError> {
        let tls_stream = acceptor.accept(stream).await?;
        Ok(Self {
            stream: Framed::new(tls_stream, BytesCodec::new()),
        })
    }
}

#[async_trait::async_trait]
impl TNetIO for TlsIO {
    fn net_type(&self) -> NetType {
        NetType::Tcp
    }

    async fn write(&mut self, bytes: Bytes) -> Result<(), NetIOError> {
        self.stream.send(bytes).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<BytesMut, NetIOError> {
        match self.stream.next().await {
            Some(Ok(data)) => Ok(data),
            Some(Err(err)) => Err(NetIOError {
                value: NetIOErrorValue::IO(err),
            }),
            None => Err(NetIOError {
                value: NetIOErrorValue::Closed,
            }),
        }
    }

    async fn read_timeout(&mut self, duration: Duration) -> Result<BytesMut, NetIOError> {
        tokio::time::timeout(duration, self.read()).await?
    }
}

/// Build a TLS acceptor from PEM certificate/key files.
pub fn tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, NetIOError> {
    let certs: Vec<Certificate> = {
        let mut reader = BufReader::new(File::open(cert_path)?);
        rustls_pemfile::certs(&mut reader)?
            .into_iter()
            .map(Certificate)
            .collect()
    };

    let key: PrivateKey = {
        let mut reader = BufReader::new(File::open(key_path)?);
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
        if keys.is_empty() {
            let mut reader = BufReader::new(File::open(key_path)?);
            keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
        }
        match keys.into_iter().next() {
            Some(k) => PrivateKey(k),
            None => {
                return Err(NetIOError {
                    value: NetIOErrorValue::Tls(format!("no private key in {key_path}")),
                })
            }
        }
    };

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| NetIOError {
            value: NetIOErrorValue::Tls(err.to_string()),
        })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A connected UDP endpoint; used by sessions that own their own port pair.
pub struct UdpIO {
    socket: UdpSocket,
}

impl UdpIO {
    pub async fn new(remote_addr: SocketAddr, local_port: u16) -> Result<Self, NetIOError> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        socket.connect(remote_addr).await?;
        Ok(Self { socket })
    }

    pub async fn bind(local_port: u16) -> Result<Self, NetIOError> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        Ok(Self { socket })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|a| a.port())
    }
}

#[async_trait::async_trait]
impl TNetIO for UdpIO {
    fn net_type(&self) -> NetType {
        NetType::Udp
    }

    async fn write(&mut self, bytes: Bytes) -> Result<(), NetIOError> {
        self.socket.send(bytes.as_ref()).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<BytesMut, NetIOError> {
        let mut buf = vec![0u8; 65536];
        let len = self.socket.recv(&mut buf).await?;
        let mut out = BytesMut::with_capacity(len);
        out.put(&buf[..len]);
        Ok(out)
    }

    async fn read_timeout(&mut self, duration: Duration) -> Result<BytesMut, NetIOError> {
        tokio::time::timeout(duration, self.read()).await?
    }
}
