use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MIN_SECRET_LENGTH: usize = 16;
pub const MAX_SECRET_LENGTH: usize = 32;

/// Type (1) + ID (8) + Port (2).
pub const HEADER_LEN: usize = 1 + 8 + 2;
pub const MIN_HELLO_LEN: usize = HEADER_LEN + MIN_SECRET_LENGTH;
pub const MAX_HELLO_LEN: usize = HEADER_LEN + MAX_SECRET_LENGTH;

const TYPE_COMMAND: u8 = 1;
const TYPE_DATA: u8 = 2;
const TYPE_SERVER_HELLO: u8 = 3;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("hello too short: {0} bytes")]
    TooShort(usize),
    #[error("hello too long: {0} bytes")]
    TooLong(usize),
    #[error("unknown hello type {0}")]
    UnknownType(u8),
    #[error("secret must be {MIN_SECRET_LENGTH}..={MAX_SECRET_LENGTH} bytes, got {0}")]
    SecretLength(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloType {
    /// Client registers a command connection for a port.
    Command,
    /// Client offers a data connection; on a command connection, the server's
    /// one-byte request for a new data connection.
    Data,
    ServerHello,
}

impl HelloType {
    pub fn as_byte(self) -> u8 {
        match self {
            HelloType::Command => TYPE_COMMAND,
            HelloType::Data => TYPE_DATA,
            HelloType::ServerHello => TYPE_SERVER_HELLO,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            TYPE_COMMAND => Some(HelloType::Command),
            TYPE_DATA => Some(HelloType::Data),
            TYPE_SERVER_HELLO => Some(HelloType::ServerHello),
            _ => None,
        }
    }
}

/// Handshake frame: `[type:1][id:8 BE][port:2 BE][secret:16..=32]`.
///
/// The secret has no length prefix; it is whatever follows the header.
#[derive(Clone, PartialEq, Eq)]
pub struct Hello {
    pub kind: HelloType,
    pub id: u64,
    pub port: u16,
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for Hello {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hello")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("port", &self.port)
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

impl Hello {
    pub fn command(port: u16, secret: &[u8]) -> Self {
        Self {
            kind: HelloType::Command,
            id: 0,
            port,
            secret: secret.to_vec(),
        }
    }

    pub fn data(id: u64, port: u16, secret: &[u8]) -> Self {
        Self {
            kind: HelloType::Data,
            id,
            port,
            secret: secret.to_vec(),
        }
    }

    pub fn server(id: u64, port: u16, secret: &[u8]) -> Self {
        Self {
            kind: HelloType::ServerHello,
            id,
            port,
            secret: secret.to_vec(),
        }
    }

    /// Encoded size of a hello carrying a secret of `secret_len` bytes.
    pub fn encoded_len(secret_len: usize) -> usize {
        HEADER_LEN + secret_len
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.secret.len()));
        out.push(self.kind.as_byte());
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.secret);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < MIN_HELLO_LEN {
            return Err(ProtocolError::TooShort(buf.len()));
        }
        if buf.len() > MAX_HELLO_LEN {
            return Err(ProtocolError::TooLong(buf.len()));
        }

        let header = HelloHeader::parse(&buf[..HEADER_LEN])?;
        Ok(header.into_hello(buf[HEADER_LEN..].to_vec()))
    }
}

/// The fixed part of a hello, read before the secret length is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloHeader {
    pub kind: HelloType,
    pub id: u64,
    pub port: u16,
}

impl HelloHeader {
    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        let kind = HelloType::from_byte(buf[0]).ok_or(ProtocolError::UnknownType(buf[0]))?;

        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[1..9]);
        let mut port = [0u8; 2];
        port.copy_from_slice(&buf[9..HEADER_LEN]);

        Ok(Self {
            kind,
            id: u64::from_be_bytes(id),
            port: u16::from_be_bytes(port),
        })
    }

    fn into_hello(self, secret: Vec<u8>) -> Hello {
        Hello {
            kind: self.kind,
            id: self.id,
            port: self.port,
            secret,
        }
    }

    pub fn with_secret(self, secret: Vec<u8>) -> Result<Hello, ProtocolError> {
        validate_secret_len(secret.len())?;
        Ok(self.into_hello(secret))
    }
}

pub fn validate_secret_len(len: usize) -> Result<(), ProtocolError> {
    if !(MIN_SECRET_LENGTH..=MAX_SECRET_LENGTH).contains(&len) {
        return Err(ProtocolError::SecretLength(len));
    }
    Ok(())
}

/// Read one hello from a stream.
///
/// With `secret_len` set, exactly that many secret bytes are consumed and any
/// bytes after them stay in the stream. Without it the secret is whatever the
/// transport delivered after the header, at least `MIN_SECRET_LENGTH` bytes and
/// at most `MAX_SECRET_LENGTH`.
pub async fn read_hello<R: AsyncRead + Unpin>(
    r: &mut R,
    secret_len: Option<usize>,
) -> Result<Hello, ProtocolError> {
    let header = read_header(r).await?;
    let secret = read_secret(r, secret_len).await?;
    header.with_secret(secret)
}

pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<HelloHeader, ProtocolError> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf).await?;
    HelloHeader::parse(&buf)
}

/// Read the secret that follows a header; see [`read_hello`] for how
/// `secret_len` bounds the read. Length errors count the header.
pub async fn read_secret<R: AsyncRead + Unpin>(
    r: &mut R,
    secret_len: Option<usize>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = [0u8; MAX_SECRET_LENGTH];
    let n = match secret_len {
        Some(len) => {
            validate_secret_len(len)?;
            r.read_exact(&mut buf[..len]).await?;
            len
        }
        None => {
            let mut n = 0;
            while n < MIN_SECRET_LENGTH {
                let m = r.read(&mut buf[n..]).await?;
                if m == 0 {
                    return Err(ProtocolError::TooShort(HEADER_LEN + n));
                }
                n += m;
            }
            n
        }
    };
    Ok(buf[..n].to_vec())
}

pub async fn write_hello<W: AsyncWrite + Unpin>(
    w: &mut W,
    hello: &Hello,
) -> Result<(), ProtocolError> {
    validate_secret_len(hello.secret.len())?;
    w.write_all(&hello.encode()).await?;
    w.flush().await?;
    Ok(())
}

/// Ask the peer on a command connection to open one data connection.
pub async fn write_data_request<W: AsyncWrite + Unpin + ?Sized>(w: &mut W) -> std::io::Result<()> {
    w.write_all(&[TYPE_DATA]).await?;
    w.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(n: usize) -> Vec<u8> {
        (0..n).map(|i| b'a' + (i % 26) as u8).collect()
    }

    #[test]
    fn encode_layout_is_big_endian() {
        let h = Hello::data(0x0102_0304_0506_0708, 0x1f90, &secret(16));
        let b = h.encode();
        assert_eq!(b.len(), 27);
        assert_eq!(b[0], 2);
        assert_eq!(&b[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&b[9..11], &[0x1f, 0x90]);
        assert_eq!(&b[11..], secret(16).as_slice());
    }

    #[test]
    fn decode_inverts_encode_at_secret_bounds() {
        for len in [MIN_SECRET_LENGTH, 24, MAX_SECRET_LENGTH] {
            let h = Hello::server(u64::MAX - 3, 65535, &secret(len));
            assert_eq!(Hello::decode(&h.encode()).unwrap(), h);
        }
    }

    #[test]
    fn decode_rejects_short_buffers() {
        let full = Hello::command(80, &secret(16)).encode();
        for n in [0, 1, HEADER_LEN, MIN_HELLO_LEN - 1] {
            match Hello::decode(&full[..n]) {
                Err(ProtocolError::TooShort(got)) => assert_eq!(got, n),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn decode_rejects_unknown_type_and_oversized_secret() {
        let mut b = Hello::command(80, &secret(16)).encode();
        b[0] = 9;
        assert!(matches!(Hello::decode(&b), Err(ProtocolError::UnknownType(9))));

        let b = Hello::command(80, &secret(33)).encode();
        assert!(matches!(Hello::decode(&b), Err(ProtocolError::TooLong(44))));
    }

    #[tokio::test]
    async fn read_hello_with_known_secret_len_leaves_trailing_bytes() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let h = Hello::data(7, 9000, &secret(20));
        let mut wire = h.encode();
        wire.extend_from_slice(b"payload");
        a.write_all(&wire).await.unwrap();

        let got = read_hello(&mut b, Some(20)).await.unwrap();
        assert_eq!(got, h);

        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn read_hello_without_len_takes_delivered_remainder() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let h = Hello::command(1263, &secret(32));
        write_hello(&mut a, &h).await.unwrap();

        let got = read_hello(&mut b, None).await.unwrap();
        assert_eq!(got, h);
    }

    #[tokio::test]
    async fn header_first_read_takes_secret_len_from_caller() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let h = Hello::data(11, 2222, &secret(16));
        let mut wire = h.encode();
        wire.extend_from_slice(b"SSH-2.0-banner");
        a.write_all(&wire).await.unwrap();

        let header = read_header(&mut b).await.unwrap();
        assert_eq!(header.kind, HelloType::Data);
        assert_eq!((header.id, header.port), (11, 2222));

        let got = header
            .with_secret(read_secret(&mut b, Some(16)).await.unwrap())
            .unwrap();
        assert_eq!(got, h);

        let mut rest = [0u8; 14];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"SSH-2.0-banner");
    }

    #[tokio::test]
    async fn read_header_rejects_unknown_type_before_the_secret() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&[9u8; HEADER_LEN]).await.unwrap();
        assert!(matches!(
            read_header(&mut b).await,
            Err(ProtocolError::UnknownType(9))
        ));
    }

    #[tokio::test]
    async fn read_hello_fails_when_peer_closes_early() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&Hello::command(1, &secret(16)).encode()[..20])
            .await
            .unwrap();
        drop(a);

        let err = read_hello(&mut b, None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TooShort(20)), "{err:?}");
    }

    #[tokio::test]
    async fn write_hello_refuses_out_of_range_secret() {
        let (mut a, _b) = tokio::io::duplex(256);
        let err = write_hello(&mut a, &Hello::command(1, &secret(8)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::SecretLength(8)));
    }
}
