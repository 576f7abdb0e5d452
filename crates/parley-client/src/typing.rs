//! Sender-side typing debounce.
//!
//! Every keystroke emits `typing` and re-arms a grace timer; if no
//! further keystroke arrives before it fires, `stopTyping` goes out.
//! Sending the message or leaving the input cancels the timer and emits
//! `stopTyping` immediately. The receiver does no debouncing of its own.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use parley_net::SocketCommand;
use parley_shared::constants::TYPING_DEBOUNCE_MS;
use parley_shared::events::ClientEvent;
use parley_shared::types::UserId;

pub struct TypingNotifier {
    cmd_tx: mpsc::Sender<SocketCommand>,
    debounce: Duration,
    timer: Option<JoinHandle<()>>,
}

impl TypingNotifier {
    pub fn new(cmd_tx: mpsc::Sender<SocketCommand>) -> Self {
        Self {
            cmd_tx,
            debounce: Duration::from_millis(TYPING_DEBOUNCE_MS),
            timer: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Emit `typing` and (re)start the inactivity timer.
    pub async fn keystroke(&mut self, peer: &UserId) {
        self.cancel_timer();

        let _ = self
            .cmd_tx
            .send(SocketCommand::Emit(ClientEvent::Typing {
                to: peer.clone(),
            }))
            .await;

        let cmd_tx = self.cmd_tx.clone();
        let peer = peer.clone();
        let debounce = self.debounce;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            debug!(peer = %peer.short(), "Typing grace elapsed");
            let _ = cmd_tx
                .send(SocketCommand::Emit(ClientEvent::StopTyping { to: peer }))
                .await;
        }));
    }

    /// The message went out: stop typing right away.
    pub async fn message_sent(&mut self, peer: &UserId) {
        self.stop_now(peer).await;
    }

    /// The input lost focus: stop typing right away.
    pub async fn blur(&mut self, peer: &UserId) {
        self.stop_now(peer).await;
    }

    async fn stop_now(&mut self, peer: &UserId) {
        self.cancel_timer();
        let _ = self
            .cmd_tx
            .send(SocketCommand::Emit(ClientEvent::StopTyping {
                to: peer.clone(),
            }))
            .await;
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TypingNotifier {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn expect_emit(cmd: Option<SocketCommand>) -> ClientEvent {
        match cmd {
            Some(SocketCommand::Emit(event)) => event,
            other => panic!("expected emit, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_elapsing_emits_stop_typing() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let mut notifier = TypingNotifier::new(cmd_tx);
        let bob = UserId::from("bob");

        notifier.keystroke(&bob).await;
        assert_eq!(
            expect_emit(cmd_rx.recv().await),
            ClientEvent::Typing { to: bob.clone() }
        );

        // No further keystroke: the 500ms grace elapses.
        assert_eq!(
            expect_emit(cmd_rx.recv().await),
            ClientEvent::StopTyping { to: bob.clone() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_keystrokes_rearm_the_timer() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let mut notifier = TypingNotifier::new(cmd_tx);
        let bob = UserId::from("bob");

        notifier.keystroke(&bob).await;
        notifier.keystroke(&bob).await;
        notifier.keystroke(&bob).await;

        // Three typing emissions, then exactly one stop.
        for _ in 0..3 {
            assert_eq!(
                expect_emit(cmd_rx.recv().await),
                ClientEvent::Typing { to: bob.clone() }
            );
        }
        assert_eq!(
            expect_emit(cmd_rx.recv().await),
            ClientEvent::StopTyping { to: bob.clone() }
        );
        assert!(
            timeout(Duration::from_secs(2), cmd_rx.recv()).await.is_err(),
            "only one stopTyping expected"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_sent_stops_immediately() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let mut notifier = TypingNotifier::new(cmd_tx);
        let bob = UserId::from("bob");

        notifier.keystroke(&bob).await;
        notifier.message_sent(&bob).await;

        assert_eq!(
            expect_emit(cmd_rx.recv().await),
            ClientEvent::Typing { to: bob.clone() }
        );
        assert_eq!(
            expect_emit(cmd_rx.recv().await),
            ClientEvent::StopTyping { to: bob.clone() }
        );
        // The cancelled timer never fires a second stop.
        assert!(
            timeout(Duration::from_secs(2), cmd_rx.recv()).await.is_err(),
            "timer should have been cancelled"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_blur_cancels_and_stops() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
        let mut notifier = TypingNotifier::new(cmd_tx);
        let bob = UserId::from("bob");

        notifier.keystroke(&bob).await;
        notifier.blur(&bob).await;

        assert_eq!(
            expect_emit(cmd_rx.recv().await),
            ClientEvent::Typing { to: bob.clone() }
        );
        assert_eq!(
            expect_emit(cmd_rx.recv().await),
            ClientEvent::StopTyping { to: bob }
        );
    }
}
