//! Wire transport (spec §4.1): TLS-over-TCP byte stream, handshake and
//! read-inactivity timeouts, and cooperative cancellation.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::sync::CancellationToken;

use crate::constants::{HANDSHAKE_TIMEOUT_SECS, READ_INACTIVITY_TIMEOUT_SECS};
use crate::error::TransportError;

/// Any duplex byte stream the codec can drive. Implemented for plain TCP,
/// TLS-over-TCP, and (in tests) in-memory duplex pipes.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

fn tls_connector() -> TlsConnector {
    let mut root_store = tokio_rustls::rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Opens the stream for a connection: plain TCP, or TLS over TCP when `tls`
/// is set, bounded by the handshake timeout. Returns a boxed `Duplex` so the
/// session doesn't need to be generic over the connection kind.
pub async fn open(host: &str, port: u16, tls: bool) -> Result<Pin<Box<dyn Duplex>>, TransportError> {
    let connect = async {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tcp.set_nodelay(true).ok();

        if tls {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            let connector = tls_connector();
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            Ok::<Pin<Box<dyn Duplex>>, TransportError>(Box::pin(tls_stream))
        } else {
            Ok::<Pin<Box<dyn Duplex>>, TransportError>(Box::pin(tcp))
        }
    };

    match timeout(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS), connect).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Wraps a future representing one read/write operation so it is bounded by
/// the read-inactivity timeout and races against cancellation. Used by the
/// codec for every socket operation, not just reads.
pub async fn with_io_timeout<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, TransportError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = timeout(Duration::from_secs(READ_INACTIVITY_TIMEOUT_SECS), fut) => {
            match result {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(TransportError::Io(e)),
                Err(_) => Err(TransportError::Timeout),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn with_io_timeout_passes_through_success() {
        let cancel = CancellationToken::new();
        let (mut a, mut b) = tokio::io::duplex(64);
        let write = with_io_timeout(&cancel, async {
            a.write_all(b"hello").await?;
            Ok(())
        });
        write.await.unwrap();
        let mut buf = [0u8; 5];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn with_io_timeout_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (mut a, _b) = tokio::io::duplex(64);
        let result: Result<(), TransportError> =
            with_io_timeout(&cancel, async { a.write_all(b"x").await }).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }
}
