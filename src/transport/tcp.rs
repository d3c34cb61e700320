//! Plain TCP transport: address-family-agnostic resolution, one connect
//! attempt per returned address, Nagle disabled.

use std::net::SocketAddr;

use tokio::net::{TcpStream, lookup_host};

use crate::error::{Error, Result};

pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| Error::Transport(format!("unable to resolve hostname '{host}': {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Transport(format!(
            "hostname '{host}' resolved to no addresses"
        )));
    }

    // Try each address in turn; report the last failure with the attempt
    // count so multi-homed hosts do not hide the real error.
    let mut last_err = None;
    let attempts = addrs.len() as u32;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream
                    .set_nodelay(true)
                    .map_err(|e| Error::io("failed to set TCP_NODELAY", &e))?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(Error::ConnectFailed {
        endpoint: format!("{host}:{port}"),
        attempts,
        reason: last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses".into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_and_disables_nagle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = connect("127.0.0.1", port).await.unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_reports_endpoint() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect("127.0.0.1", port).await.unwrap_err();
        match err {
            Error::ConnectFailed { endpoint, attempts, .. } => {
                assert_eq!(endpoint, format!("127.0.0.1:{port}"));
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
