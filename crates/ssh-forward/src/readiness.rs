use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::endpoint::Endpoint;

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Succeeds when a TCP connect to `addr` completes within `timeout`.
pub async fn check_listening(addr: &Endpoint, timeout: Duration) -> io::Result<()> {
    match tokio::time::timeout(timeout, TcpStream::connect((addr.host(), addr.port()))).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("nothing accepted on {addr} within {timeout:?}"),
        )),
    }
}

/// Poll [`check_listening`] until it succeeds or `deadline` has passed.
pub async fn wait_until_listening(addr: &Endpoint, deadline: Duration) -> io::Result<()> {
    const RETRY_INTERVAL: Duration = Duration::from_millis(100);

    let started = tokio::time::Instant::now();
    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        let attempt = remaining.min(DEFAULT_CHECK_TIMEOUT);

        match check_listening(addr, attempt).await {
            Ok(()) => return Ok(()),
            Err(e) if started.elapsed() + RETRY_INTERVAL >= deadline => return Err(e),
            Err(e) => {
                tracing::trace!("{addr} not listening yet: {e}");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_check_listening_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = Endpoint::from(listener.local_addr().unwrap());
        assert!(check_listening(&addr, DEFAULT_CHECK_TIMEOUT).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_listening_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(check_listening(&Endpoint::localhost(port), DEFAULT_CHECK_TIMEOUT)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wait_until_listening_sees_late_listener() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            TcpListener::bind(("127.0.0.1", port)).await.unwrap()
        });

        let result = wait_until_listening(&Endpoint::localhost(port), Duration::from_secs(5)).await;
        assert!(result.is_ok(), "{result:?}");
        drop(late);
    }
}
