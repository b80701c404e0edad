//! Raw byte relay between a proxy client and a tunnel target.
//!
//! Target-to-client bytes are pumped by a task owned by the relay. The
//! client-to-target direction is driven by the connection's read half, which
//! forwards through a [`TunnelInlet`] once the connection has been directed
//! into the tunnel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RELAY_CHUNK: usize = 16 * 1024;

/// Handle on a running tunnel. Clones share the same tunnel.
#[derive(Clone)]
pub struct TunnelRelay {
    cancel: CancellationToken,
    opened: Instant,
    /// Milliseconds since `opened` at the last relayed byte.
    last_activity: Arc<AtomicU64>,
    idle_timeout: Duration,
}

impl TunnelRelay {
    /// Start relaying `target` to `sink`. Returns the relay, the inlet for
    /// client bytes, and the pump task.
    pub fn open<S>(sink: S, target: TcpStream, idle_timeout: Duration) -> (Self, TunnelInlet, JoinHandle<()>)
    where
        S: AsyncWrite + Unpin + Send + 'static,
    {
        let relay = Self {
            cancel: CancellationToken::new(),
            opened: Instant::now(),
            last_activity: Arc::new(AtomicU64::new(0)),
            idle_timeout,
        };
        let (target_rd, target_wr) = target.into_split();
        let pump = tokio::spawn(relay.clone().pump(target_rd, sink));
        let inlet = TunnelInlet {
            target: target_wr,
            relay: relay.clone(),
        };
        (relay, inlet, pump)
    }

    /// End the relay. Safe to call any number of times; wakes the pump.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!("closing tunnel");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the relay is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    fn touch(&self) {
        let elapsed = self.opened.elapsed().as_millis() as u64;
        self.last_activity.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(last)
    }

    async fn pump<R, S>(self, mut target: R, mut sink: S)
    where
        R: AsyncRead + Unpin,
        S: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; RELAY_CHUNK];
        loop {
            let idle_left = self.idle_timeout.saturating_sub(self.idle_for());
            tokio::select! {
                () = self.cancel.cancelled() => break,
                read = target.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("tunnel target closed the connection");
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = sink.write_all(&buf[..n]).await {
                            debug!("tunnel client write failed: {e}");
                            break;
                        }
                        self.touch();
                    }
                    Err(e) => {
                        debug!("tunnel target read failed: {e}");
                        break;
                    }
                },
                () = tokio::time::sleep(idle_left) => {
                    if self.idle_for() >= self.idle_timeout {
                        debug!("tunnel idle for {:?}, closing", self.idle_timeout);
                        break;
                    }
                }
            }
        }
        let _ = sink.shutdown().await;
        self.close();
    }
}

/// Client-to-target direction of a tunnel.
pub struct TunnelInlet {
    target: OwnedWriteHalf,
    relay: TunnelRelay,
}

impl TunnelInlet {
    pub fn relay(&self) -> &TunnelRelay {
        &self.relay
    }

    pub async fn forward(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.target.write_all(bytes).await?;
        self.relay.touch();
        Ok(())
    }

    /// Forward everything `client` sends until it closes or the relay ends.
    /// Closes the relay on return.
    pub async fn run<R>(mut self, mut client: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; RELAY_CHUNK];
        let cancel = self.relay.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                read = client.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("tunnel client closed the connection");
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = self.forward(&buf[..n]).await {
                            debug!("tunnel target write failed: {e}");
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tunnel client read failed: {e}");
                        break;
                    }
                },
            }
        }
        let _ = self.target.shutdown().await;
        self.relay.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    /// A connected pair of TCP streams on loopback.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (target_near, mut target_far) = tcp_pair().await;
        let (sink, mut client_view) = duplex(1024);
        let (client_in, mut client_out) = duplex(1024);
        let (relay, inlet, pump) = TunnelRelay::open(sink, target_near, Duration::from_secs(5));
        let inlet_task = tokio::spawn(inlet.run(client_in));

        client_out.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        target_far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        target_far.write_all(b"pong").await.unwrap();
        client_view.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        drop(target_far);
        pump.await.unwrap();
        assert!(relay.is_closed());
        inlet_task.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_wakes_the_pump() {
        let (target_near, _target_far) = tcp_pair().await;
        let (sink, _client_view) = duplex(64);
        let (relay, _inlet, pump) = TunnelRelay::open(sink, target_near, Duration::from_secs(60));
        relay.close();
        relay.close();
        tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(relay.is_closed());
    }

    #[tokio::test]
    async fn idle_tunnel_is_closed() {
        let (target_near, _target_far) = tcp_pair().await;
        let (sink, _client_view) = duplex(64);
        let (relay, _inlet, pump) = TunnelRelay::open(sink, target_near, Duration::from_millis(100));
        tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(relay.is_closed());
    }

    #[tokio::test]
    async fn activity_defers_idle_close() {
        let (target_near, mut target_far) = tcp_pair().await;
        let (sink, mut client_view) = duplex(64);
        let (relay, _inlet, _pump) = TunnelRelay::open(sink, target_near, Duration::from_millis(300));
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            target_far.write_all(b"x").await.unwrap();
            let mut one = [0u8; 1];
            client_view.read_exact(&mut one).await.unwrap();
        }
        assert!(!relay.is_closed());
        relay.closed().await;
    }
}
