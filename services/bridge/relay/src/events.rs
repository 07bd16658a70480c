//! Session event dispatch shared by both relay roles.

use bridge_session::{InputStream, PeerSession, SessionEvent, SessionState};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Reactions of a relay to its session's events.
pub(crate) trait SessionHandler: Send + Sync + 'static {
    /// The peer opened a named stream towards us.
    fn on_input_stream(self: &Arc<Self>, name: String, stream: InputStream);

    /// The session reached `NotConnected`.
    fn on_session_lost(self: &Arc<Self>);
}

/// Attach to `session` and dispatch its events to `handler` until the session
/// is lost or the handler is dropped.
pub(crate) fn attach<H: SessionHandler>(session: &dyn PeerSession, handler: Weak<H>) {
    let (tx, rx) = mpsc::unbounded_channel();
    session.attach(tx);
    let peer = session.peer().clone();
    tokio::spawn(async move {
        dispatch(handler, rx).await;
        debug!("Stopped dispatching session events from {}", peer);
    });
}

async fn dispatch<H: SessionHandler>(
    handler: Weak<H>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(handler) = handler.upgrade() else {
            break;
        };
        match event {
            SessionEvent::InputStream { name, stream } => handler.on_input_stream(name, stream),
            SessionEvent::StateChanged(state) => {
                info!("Relay session is now {}", state);
                if state == SessionState::NotConnected {
                    handler.on_session_lost();
                    break;
                }
            }
        }
    }
}
