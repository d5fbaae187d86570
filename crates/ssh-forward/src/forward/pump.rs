use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction by one [`pump`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy bytes between `a` and `b` in both directions until both are done.
///
/// EOF on one side is passed on as a shutdown of the other side's write half,
/// so half-closed connections keep flowing the other way. An I/O error in
/// either direction ends both. Both streams are shut down before this returns.
/// Errors are logged, never returned; the stats are zero after an error.
pub async fn pump<A, B>(mut a: A, mut b: B, buffer_size: usize) -> PumpStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    // A zero-sized buffer would read as EOF straight away
    let buffer_size = buffer_size.max(1);

    let copied =
        tokio::io::copy_bidirectional_with_sizes(&mut a, &mut b, buffer_size, buffer_size).await;

    let stats = match copied {
        Ok((a_to_b, b_to_a)) => PumpStats { a_to_b, b_to_a },
        Err(e) => {
            tracing::warn!("Connection copy failed: {e}");
            PumpStats::default()
        }
    };

    let _ = a.shutdown().await;
    let _ = b.shutdown().await;

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_pump_relays_both_directions_with_half_close() {
        let (mut client, a) = duplex(64);
        let (b, mut server) = duplex(64);

        let pumping = tokio::spawn(pump(a, b, 16));

        let backend = tokio::spawn(async move {
            let mut request = Vec::new();
            server.read_to_end(&mut request).await.unwrap();
            server.write_all(b"world").await.unwrap();
            server.shutdown().await.unwrap();
            request
        });

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        assert_eq!(response, b"world");
        assert_eq!(backend.await.unwrap(), payload);

        let stats = tokio::time::timeout(Duration::from_secs(1), pumping)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stats,
            PumpStats {
                a_to_b: payload.len() as u64,
                b_to_a: 5,
            }
        );
    }

    #[tokio::test]
    async fn test_pump_write_error_ends_both_directions() {
        let (mut client, a) = duplex(64);
        let (b, server) = duplex(64);
        drop(server);

        let pumping = tokio::spawn(pump(a, b, 16));

        // Writing towards the dropped side fails; the pump must not wait on the
        // client, which never closes its end.
        client.write_all(b"x").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), pumping)
            .await
            .expect("pump should finish once one direction fails")
            .unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pump_zero_buffer_size_still_copies() {
        let (mut client, a) = duplex(8);
        let (b, mut server) = duplex(8);

        tokio::spawn(pump(a, b, 0));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
