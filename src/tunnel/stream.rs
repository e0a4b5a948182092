/// A bidirectional async byte stream.
///
/// Trait objects only allow one non-auto principal trait, so `AsyncRead + AsyncWrite`
/// is folded into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub type BoxedWriter = Box<dyn tokio::io::AsyncWrite + Unpin + Send>;

/// Box a TCP stream, turning off Nagle so one-byte signals and handshakes
/// are not held back.
pub fn boxed_tcp(c: tokio::net::TcpStream) -> BoxedStream {
    let _ = c.set_nodelay(true);
    Box::new(c)
}
