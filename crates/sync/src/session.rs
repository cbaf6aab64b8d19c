//! Push channel lifecycle: connect, reconnect with capped exponential
//! backoff, and give up into a persistent offline state.

use core::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use docket_config::ReconnectConfig;
use docket_primitives::event::RawPushEvent;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::effects::PushTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// The retry budget is exhausted; only an explicit restart reconnects.
    Offline,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Receives what the session delivers.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    fn on_event(&self, event: RawPushEvent);

    /// Called on every transition into `Connected`, before any event of the
    /// new connection is delivered. `reconnect` is false only for the first
    /// connection of a run.
    async fn on_connected(&self, reconnect: bool);
}

pub struct SessionController {
    config: ReconnectConfig,
    transport: Arc<dyn PushTransport>,
    state: watch::Sender<SessionState>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    #[must_use]
    pub fn new(config: ReconnectConfig, transport: Arc<dyn PushTransport>) -> Self {
        let (state, _rx) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            transport,
            state,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Session state changed");
        }
    }

    /// Keeps the push subscription for `scope` alive until `cancel` fires or
    /// the retry budget runs out.
    pub async fn run(&self, scope: &str, hooks: &dyn SessionHooks, cancel: CancellationToken) {
        let mut failures: u32 = 0;
        let mut connected_before = false;

        loop {
            self.transition(SessionState::Connecting);

            let attempt = tokio::select! {
                () = cancel.cancelled() => break,
                attempt = self.transport.subscribe(scope) => attempt,
            };

            match attempt {
                Ok(mut stream) => {
                    failures = 0;
                    self.transition(SessionState::Connected);
                    info!(%scope, reconnect = connected_before, "Push channel connected");

                    hooks.on_connected(connected_before).await;
                    connected_before = true;

                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => {
                                self.transition(SessionState::Disconnected);
                                return;
                            }
                            event = stream.next() => match event {
                                Some(event) => hooks.on_event(event),
                                None => break,
                            },
                        }
                    }

                    warn!(%scope, "Push channel dropped");
                    self.transition(SessionState::Disconnected);

                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = sleep(self.config.base_delay) => {}
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures >= self.config.max_attempts {
                        warn!(%scope, %err, failures, "Giving up on push channel");
                        self.transition(SessionState::Offline);
                        return;
                    }

                    let delay = self.config.delay_for(failures);
                    debug!(%scope, %err, failures, ?delay, "Connection attempt failed, backing off");
                    self.transition(SessionState::Disconnected);

                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = sleep(delay) => {}
                    }
                }
            }
        }

        self.transition(SessionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use futures_util::stream;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::effects::PushStream;
    use crate::error::TransportError;

    /// Refuses the first `refuse` attempts, then serves one scripted
    /// connection per remaining entry of `connections`.
    struct ScriptedTransport {
        refuse: Mutex<u32>,
        attempts: Mutex<Vec<Instant>>,
        connections: Mutex<Vec<PushStream>>,
    }

    #[async_trait]
    impl PushTransport for ScriptedTransport {
        async fn subscribe(&self, _scope: &str) -> Result<PushStream, TransportError> {
            self.attempts.lock().push(Instant::now());
            {
                let mut refuse = self.refuse.lock();
                if *refuse > 0 {
                    *refuse -= 1;
                    return Err(TransportError::Refused("scripted".to_owned()));
                }
            }
            let next = self.connections.lock().pop();
            next.ok_or_else(|| TransportError::Refused("no more connections".to_owned()))
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
        connects: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl SessionHooks for RecordingHooks {
        fn on_event(&self, event: RawPushEvent) {
            self.events.lock().push(event.name);
        }

        async fn on_connected(&self, reconnect: bool) {
            self.connects.lock().push(reconnect);
        }
    }

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            max_attempts,
        }
    }

    fn event(name: &str) -> RawPushEvent {
        RawPushEvent {
            name: name.to_owned(),
            data: serde_json::Value::Null,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_offline() {
        let transport = Arc::new(ScriptedTransport {
            refuse: Mutex::new(u32::MAX),
            attempts: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        });
        let session = SessionController::new(config(5), transport.clone());
        let hooks = RecordingHooks::default();

        session.run("tickets", &hooks, CancellationToken::new()).await;

        assert_eq!(session.state(), SessionState::Offline);
        let attempts = transport.attempts.lock().clone();
        let gaps: Vec<_> = attempts.windows(2).map(|pair| pair[1] - pair[0]).collect();
        assert_eq!(
            gaps,
            [100, 200, 400, 400].map(Duration::from_millis),
            "capped exponential backoff"
        );
        assert!(hooks.connects.lock().is_empty(), "never connected");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_is_flagged_and_resets_budget() {
        let (tx, rx) = mpsc::unbounded_channel();
        let second: PushStream = Box::pin(UnboundedReceiverStream::new(rx));
        let first: PushStream = Box::pin(stream::iter(vec![event("ticket.updated")]));

        let transport = Arc::new(ScriptedTransport {
            refuse: Mutex::new(0),
            attempts: Mutex::new(Vec::new()),
            // popped from the back
            connections: Mutex::new(vec![second, first]),
        });
        let session = Arc::new(SessionController::new(config(3), transport));
        let hooks = Arc::new(RecordingHooks::default());
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let session = Arc::clone(&session);
            let hooks = Arc::clone(&hooks);
            let cancel = cancel.clone();
            async move { session.run("tickets", &*hooks, cancel).await }
        });

        let mut state = session.watch();
        state
            .wait_for(|state| *state == SessionState::Connected)
            .await
            .map(|_| ())
            .expect("session alive");
        tx.send(event("ticket.deleted")).expect("stream open");
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(*hooks.connects.lock(), vec![false, true], "second connect is a reconnect");
        assert_eq!(
            *hooks.events.lock(),
            vec!["ticket.updated".to_owned(), "ticket.deleted".to_owned()]
        );

        cancel.cancel();
        run.await.expect("run task finished");
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
