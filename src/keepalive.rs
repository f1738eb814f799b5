//! Keepalive supervision for an open socket.
//!
//! A supervisor task per socket sends a WebSocket ping, waits for the pong,
//! and reports the result to the owning connection. Failure counts are keyed
//! by socket so a dying socket that is still being drained after a reconnect
//! can never reset or bump the fresh socket's count.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::KeepaliveConfig;
use crate::connection::WeakConnection;
use crate::error::SocketId;

/// What the supervisor should do after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe again after this delay.
    Next(Duration),
    /// The failure threshold was reached; stop probing this socket.
    Escalate { failures: u32 },
}

#[derive(Debug)]
pub struct KeepaliveTracker {
    timing: KeepaliveConfig,
    failures: HashMap<SocketId, u32>,
}

impl KeepaliveTracker {
    pub fn new(timing: KeepaliveConfig) -> Self {
        Self {
            timing,
            failures: HashMap::new(),
        }
    }

    pub fn failures(&self, socket: SocketId) -> u32 {
        self.failures.get(&socket).copied().unwrap_or(0)
    }

    pub fn record(&mut self, socket: SocketId, ok: bool) -> ProbeOutcome {
        if ok {
            self.failures.remove(&socket);
            return ProbeOutcome::Next(self.timing.interval());
        }
        let count = self.failures.entry(socket).or_insert(0);
        *count += 1;
        if *count >= self.timing.max_failures {
            let failures = *count;
            self.failures.remove(&socket);
            ProbeOutcome::Escalate { failures }
        } else {
            ProbeOutcome::Next(self.timing.retry())
        }
    }

    /// Forget a socket that will never be probed again.
    pub fn forget(&mut self, socket: SocketId) {
        self.failures.remove(&socket);
    }
}

/// Send one ping and wait for any pong to arrive.
async fn probe(
    outbound: &mpsc::Sender<Message>,
    pongs: &mut watch::Receiver<u64>,
    timeout: Duration,
) -> bool {
    pongs.borrow_and_update();
    if outbound.send(Message::Ping(vec![].into())).await.is_err() {
        return false;
    }
    matches!(tokio::time::timeout(timeout, pongs.changed()).await, Ok(Ok(())))
}

pub(crate) async fn supervise(
    connection: WeakConnection,
    socket: SocketId,
    outbound: mpsc::Sender<Message>,
    mut pongs: watch::Receiver<u64>,
    cancel: CancellationToken,
    timing: KeepaliveConfig,
) {
    let mut delay = timing.initial_delay();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        let ok = tokio::select! {
            _ = cancel.cancelled() => break,
            ok = probe(&outbound, &mut pongs, timing.probe_timeout()) => ok,
        };
        let Some(connection) = connection.upgrade() else {
            return;
        };
        match connection.record_probe(socket, ok) {
            ProbeOutcome::Next(next) => delay = next,
            ProbeOutcome::Escalate { .. } => return,
        }
    }
    if let Some(connection) = connection.upgrade() {
        connection.forget_probes(socket);
    }
    tracing::debug!(socket, "keepalive supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> KeepaliveTracker {
        KeepaliveTracker::new(KeepaliveConfig::default())
    }

    #[test]
    fn success_schedules_healthy_interval() {
        let mut t = tracker();
        assert_eq!(t.record(1, true), ProbeOutcome::Next(Duration::from_secs(20)));
    }

    #[test]
    fn failure_schedules_retry() {
        let mut t = tracker();
        assert_eq!(t.record(1, false), ProbeOutcome::Next(Duration::from_secs(3)));
        assert_eq!(t.failures(1), 1);
    }

    #[test]
    fn third_failure_escalates_once() {
        let mut t = tracker();
        t.record(1, false);
        t.record(1, false);
        assert_eq!(t.record(1, false), ProbeOutcome::Escalate { failures: 3 });
        assert_eq!(t.failures(1), 0);
    }

    #[test]
    fn success_resets_the_count() {
        let mut t = tracker();
        t.record(1, false);
        t.record(1, false);
        t.record(1, true);
        assert_eq!(t.failures(1), 0);
        assert!(matches!(t.record(1, false), ProbeOutcome::Next(_)));
        assert!(matches!(t.record(1, false), ProbeOutcome::Next(_)));
        assert!(matches!(t.record(1, false), ProbeOutcome::Escalate { .. }));
    }

    #[test]
    fn sockets_are_counted_separately() {
        let mut t = tracker();
        t.record(1, false);
        t.record(1, false);
        // A healthy new socket must not reset the old one's count.
        t.record(2, true);
        t.record(2, false);
        assert_eq!(t.failures(1), 2);
        assert_eq!(t.failures(2), 1);
        assert!(matches!(t.record(1, false), ProbeOutcome::Escalate { .. }));
        assert_eq!(t.failures(2), 1);
    }

    #[tokio::test]
    async fn probe_fails_when_writer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_pong_tx, mut pongs) = watch::channel(0u64);
        assert!(!probe(&tx, &mut pongs, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn probe_succeeds_on_pong() {
        let (tx, mut rx) = mpsc::channel(1);
        let (pong_tx, mut pongs) = watch::channel(0u64);
        tokio::spawn(async move {
            if let Some(Message::Ping(_)) = rx.recv().await {
                pong_tx.send_modify(|n| *n += 1);
            }
            // Keep the sender alive until the probe has seen the pong.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        assert!(probe(&tx, &mut pongs, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn probe_times_out_without_pong() {
        let (tx, _rx) = mpsc::channel(1);
        let (_pong_tx, mut pongs) = watch::channel(0u64);
        assert!(!probe(&tx, &mut pongs, Duration::from_millis(20)).await);
    }
}
