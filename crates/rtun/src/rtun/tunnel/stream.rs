/// A bidirectional async byte stream.
///
/// Trait objects can only have a single non-auto principal trait, so
/// `AsyncRead + AsyncWrite` is folded into one.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;
