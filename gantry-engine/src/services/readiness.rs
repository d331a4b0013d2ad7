// Service Readiness
// Polls TCP ports until a service accepts connections or the deadline passes

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Lower bound for a single connection attempt
const MIN_ATTEMPT: Duration = Duration::from_millis(50);

/// Try a single TCP connection to `127.0.0.1:port`
pub async fn probe_tcp(port: u16, attempt_timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        timeout(attempt_timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Call `probe` every `interval` until it reports ready.
///
/// `probe` receives the budget for one attempt. Returns the time it took,
/// or `None` once `deadline` has elapsed.
pub async fn wait_until<F, Fut>(deadline: Duration, interval: Duration, mut probe: F) -> Option<Duration>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();

    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return None;
        }

        if probe(remaining.min(interval.max(MIN_ATTEMPT))).await {
            return Some(started.elapsed());
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return None;
        }
        sleep(interval.min(remaining)).await;
    }
}

/// Poll `port` on localhost until it accepts a connection
pub async fn wait_for_port(port: u16, deadline: Duration, interval: Duration) -> Option<Duration> {
    wait_until(deadline, interval, |attempt| probe_tcp(port, attempt)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe_tcp(port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_closed_port() {
        let port = closed_port().await;

        let waited =
            wait_for_port(port, Duration::from_millis(200), Duration::from_millis(20)).await;
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn test_wait_sees_late_listener() {
        let port = closed_port().await;

        let server = tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        let waited = wait_for_port(port, Duration::from_secs(5), Duration::from_millis(20)).await;
        assert!(waited.is_some());
        server.abort();
    }

    #[tokio::test]
    async fn test_wait_until_counts_attempts() {
        let attempts = AtomicUsize::new(0);

        let waited = wait_until(Duration::from_secs(5), Duration::from_millis(1), |_| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { n >= 2 }
        })
        .await;

        assert!(waited.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
