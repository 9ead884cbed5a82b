//! Login/logout handshake coordinator.
//!
//! Each channel runs one coordinator before user traffic is permitted. The
//! client side sends `Login` and waits (bounded by the login timeout) for
//! the outcome; the server side validates credentials through an injected
//! authenticator and gates user-message dispatch until the session is
//! established. Logout runs the same dance in reverse during graceful
//! close.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    context::ChannelContext,
    error::{CommError, CommResult, RetCode},
    message::{Credentials, ProtocolMessage},
    pipeline::TxPipeline,
};

/// Server-side credential check. Absent one, any credentials are accepted.
pub type Authenticator =
    Arc<dyn Fn(Credentials) -> BoxFuture<'static, CommResult<()>> + Send + Sync>;

/// Handshake progress of one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    PendingLogin,
    LoggedIn,
    PendingLogout,
    LoggedOut,
}

/// Which half of the handshake this coordinator plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionRole {
    Client,
    Server,
}

pub(crate) struct SessionCoordinator {
    ctx: Arc<ChannelContext>,
    pipeline: Arc<TxPipeline>,
    role: SessionRole,
    login_timeout: Duration,
    logout_timeout: Duration,
    state: Mutex<SessionState>,
    login_waiter: Mutex<Option<oneshot::Sender<CommResult<()>>>>,
    logout_waiter: Mutex<Option<oneshot::Sender<()>>>,
    cancel: CancellationToken,
    authenticator: Option<Authenticator>,
}

impl SessionCoordinator {
    pub(crate) fn new(
        ctx: Arc<ChannelContext>,
        pipeline: Arc<TxPipeline>,
        role: SessionRole,
        login_timeout: Duration,
        logout_timeout: Duration,
        authenticator: Option<Authenticator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            pipeline,
            role,
            login_timeout,
            logout_timeout,
            state: Mutex::new(SessionState::PendingLogin),
            login_waiter: Mutex::new(None),
            logout_waiter: Mutex::new(None),
            cancel: CancellationToken::new(),
            authenticator,
        })
    }

    /// True once the handshake established the session.
    pub(crate) fn is_logged_in(&self) -> bool {
        *self.state.lock().expect("session state poisoned") == SessionState::LoggedIn
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().expect("session state poisoned")
    }

    /// Abort any handshake wait; used by channel shutdown.
    pub(crate) fn shutdown(&self) { self.cancel.cancel(); }

    /// Client side: send `Login` and await the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::InvalidCredentials`] (or the server's code) when
    /// refused, [`RetCode::LoginTimeout`] when no response arrives in time,
    /// [`RetCode::OperationCanceled`] when shutdown interrupts the wait.
    pub(crate) async fn login(&self, credentials: Credentials) -> CommResult<()> {
        debug_assert_eq!(self.role, SessionRole::Client);
        let (tx, rx) = oneshot::channel();
        *self.login_waiter.lock().expect("login waiter poisoned") = Some(tx);

        self.pipeline
            .send(&ProtocolMessage::Login { credentials })
            .await?;

        let outcome = tokio::select! {
            () = self.cancel.cancelled() => {
                Err(CommError::new(RetCode::OperationCanceled, "shutdown during login"))
            }
            waited = tokio::time::timeout(self.login_timeout, rx) => match waited {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CommError::code(RetCode::ChannelClosed)),
                Err(_) => Err(CommError::new(
                    RetCode::LoginTimeout,
                    format!("no login response within {:?}", self.login_timeout),
                )),
            },
        };
        if outcome.is_ok() {
            *self.state.lock().expect("session state poisoned") = SessionState::LoggedIn;
        }
        outcome
    }

    /// Client side: run the logout exchange during graceful close.
    ///
    /// Best effort: a missing or late confirmation is logged with
    /// [`RetCode::LogoutTimeout`] and the close proceeds; the session ends
    /// `LoggedOut` either way.
    pub(crate) async fn logout(&self) {
        {
            let mut state = self.state.lock().expect("session state poisoned");
            if *state != SessionState::LoggedIn {
                return;
            }
            *state = SessionState::PendingLogout;
        }
        let (tx, rx) = oneshot::channel();
        *self.logout_waiter.lock().expect("logout waiter poisoned") = Some(tx);

        if let Err(error) = self.pipeline.send(&ProtocolMessage::Logout).await {
            debug!("channel {}: logout not sent: {error}", self.ctx.id());
        } else {
            tokio::select! {
                () = self.cancel.cancelled() => {}
                waited = tokio::time::timeout(self.logout_timeout, rx) => {
                    if waited.is_err() {
                        warn!(
                            "channel {}: {:?}: no logout confirmation within {:?}",
                            self.ctx.id(),
                            RetCode::LogoutTimeout,
                            self.logout_timeout
                        );
                    }
                }
            }
        }
        *self.state.lock().expect("session state poisoned") = SessionState::LoggedOut;
    }

    /// Route one session-control message to the coordinator.
    pub(crate) async fn on_message(&self, msg: ProtocolMessage) {
        match (self.role, msg) {
            (SessionRole::Client, ProtocolMessage::LoginResponse { error }) => {
                let waiter = self.login_waiter.lock().expect("login waiter poisoned").take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(match error {
                            None => Ok(()),
                            Some(error) => Err(error),
                        });
                    }
                    None => warn!("channel {}: unsolicited login response", self.ctx.id()),
                }
            }
            (SessionRole::Client, ProtocolMessage::LogoutResponse) => {
                let waiter = self.logout_waiter.lock().expect("logout waiter poisoned").take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => warn!("channel {}: unsolicited logout response", self.ctx.id()),
                }
            }
            (SessionRole::Server, ProtocolMessage::Login { credentials }) => {
                self.serve_login(credentials).await;
            }
            (SessionRole::Server, ProtocolMessage::Logout) => {
                *self.state.lock().expect("session state poisoned") = SessionState::LoggedOut;
                if let Err(error) = self.pipeline.send(&ProtocolMessage::LogoutResponse).await {
                    debug!("channel {}: logout response not sent: {error}", self.ctx.id());
                }
                self.ctx.trigger_close(CommError::new(
                    RetCode::ChannelClosedByOtherSide,
                    "peer logged out",
                ));
            }
            (role, other) => warn!(
                "channel {}: {:?} unexpected for {role:?} coordinator",
                self.ctx.id(),
                other.kind()
            ),
        }
    }

    async fn serve_login(&self, credentials: Credentials) {
        {
            let state = self.state.lock().expect("session state poisoned");
            if *state != SessionState::PendingLogin {
                warn!("channel {}: repeated login ignored", self.ctx.id());
                return;
            }
        }
        let verdict = match &self.authenticator {
            None => Ok(()),
            Some(authenticate) => authenticate(credentials).await,
        };
        match verdict {
            Ok(()) => {
                *self.state.lock().expect("session state poisoned") = SessionState::LoggedIn;
                if let Err(error) = self
                    .pipeline
                    .send(&ProtocolMessage::LoginResponse { error: None })
                    .await
                {
                    debug!("channel {}: login response not sent: {error}", self.ctx.id());
                }
            }
            Err(refusal) => {
                let _ = self
                    .pipeline
                    .send(&ProtocolMessage::LoginResponse {
                        error: Some(refusal.clone()),
                    })
                    .await;
                self.ctx.trigger_close(refusal);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        buffer::{SegmentPool, TxBuffer},
        context::next_channel_id,
    };

    fn coordinator(
        role: SessionRole,
        login_timeout: Duration,
        authenticator: Option<Authenticator>,
    ) -> (Arc<SessionCoordinator>, mpsc::Receiver<CommError>) {
        let pool = Arc::new(SegmentPool::new(4096, 4));
        let pipeline = crate::pipeline::TxPipeline::new(Arc::new(TxBuffer::new(pool)));
        let (close_tx, close_rx) = mpsc::channel(1);
        let ctx = Arc::new(ChannelContext::new(next_channel_id(), close_tx));
        (
            SessionCoordinator::new(
                ctx,
                pipeline,
                role,
                login_timeout,
                Duration::from_millis(100),
                authenticator,
            ),
            close_rx,
        )
    }

    #[tokio::test]
    async fn login_resolves_on_accepting_response() {
        let (coordinator, _close) =
            coordinator(SessionRole::Client, Duration::from_secs(1), None);
        let login = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.login(Credentials::new("a", "b")).await })
        };
        tokio::task::yield_now().await;
        coordinator
            .on_message(ProtocolMessage::LoginResponse { error: None })
            .await;
        login.await.expect("join").expect("login");
        assert!(coordinator.is_logged_in());
    }

    #[tokio::test]
    async fn login_refusal_carries_the_server_code() {
        let (coordinator, _close) =
            coordinator(SessionRole::Client, Duration::from_secs(1), None);
        let login = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.login(Credentials::new("a", "bad")).await })
        };
        tokio::task::yield_now().await;
        coordinator
            .on_message(ProtocolMessage::LoginResponse {
                error: Some(CommError::code(RetCode::InvalidCredentials)),
            })
            .await;
        let err = login.await.expect("join").expect_err("refused");
        assert_eq!(err.code, RetCode::InvalidCredentials);
        assert!(!coordinator.is_logged_in());
    }

    #[tokio::test(start_paused = true)]
    async fn login_times_out_without_a_response() {
        let (coordinator, _close) =
            coordinator(SessionRole::Client, Duration::from_secs(2), None);
        let err = coordinator
            .login(Credentials::default())
            .await
            .expect_err("timeout");
        assert_eq!(err.code, RetCode::LoginTimeout);
    }

    #[tokio::test]
    async fn server_refusal_faults_the_channel() {
        let authenticator: Authenticator = Arc::new(|_credentials| {
            Box::pin(async { Err(CommError::code(RetCode::InvalidCredentials)) })
        });
        let (coordinator, mut close) = coordinator(
            SessionRole::Server,
            Duration::from_secs(1),
            Some(authenticator),
        );
        coordinator
            .on_message(ProtocolMessage::Login {
                credentials: Credentials::new("nobody", "x"),
            })
            .await;
        assert_eq!(
            close.recv().await.expect("close reason").code,
            RetCode::InvalidCredentials
        );
        assert!(!coordinator.is_logged_in());
    }

    #[tokio::test]
    async fn server_accepts_and_gates_until_login() {
        let (coordinator, _close) =
            coordinator(SessionRole::Server, Duration::from_secs(1), None);
        assert!(!coordinator.is_logged_in());
        coordinator
            .on_message(ProtocolMessage::Login {
                credentials: Credentials::new("svc", "ok"),
            })
            .await;
        assert!(coordinator.is_logged_in());
    }

    #[tokio::test]
    async fn server_logout_closes_gracefully() {
        let (coordinator, mut close) =
            coordinator(SessionRole::Server, Duration::from_secs(1), None);
        coordinator
            .on_message(ProtocolMessage::Login {
                credentials: Credentials::default(),
            })
            .await;
        coordinator.on_message(ProtocolMessage::Logout).await;
        assert_eq!(coordinator.state(), SessionState::LoggedOut);
        assert_eq!(
            close.recv().await.expect("close reason").code,
            RetCode::ChannelClosedByOtherSide
        );
    }
}
