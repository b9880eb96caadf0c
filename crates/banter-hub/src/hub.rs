//! The hub event loop.
//!
//! One tokio task owns the registry and history outright; producers
//! (connection read pumps, the profile-update route) submit [`HubEvent`]s
//! through a [`HubHandle`] and never touch shared state directly. Events
//! are processed strictly in arrival order, which is what gives every
//! recipient the same total order of broadcasts and lets a new joiner see
//! history-then-live with no gap and no duplication.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use banter_core::ids::SessionId;
use banter_core::messages::{ChatMessage, HistoryFrame, UserUpdateFrame};
use banter_core::profile::{IdentityStore, ProfileRecord};

use crate::history::History;

/// Mailbox capacity for the hub event channel.
const HUB_CHANNEL_BUFFER: usize = 1024;

#[derive(Clone, Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub is no longer running")]
    Closed,
}

/// Server-side state for one live connection, owned by the hub once
/// registered.
pub struct Session {
    id: SessionId,
    /// Cached identity snapshot. The hub is the only writer; the
    /// connection's read pump reads it to stamp outgoing messages.
    profile: Arc<RwLock<ProfileRecord>>,
    /// Bounded FIFO outbound queue; the receiving half is drained by the
    /// connection's write pump.
    tx: mpsc::Sender<String>,
}

impl Session {
    /// Create a session and the receiving half of its outbound queue.
    pub fn new(profile: ProfileRecord, queue_size: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_size);
        (
            Self {
                id: SessionId::new(),
                profile: Arc::new(RwLock::new(profile)),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Shared handle to the identity snapshot.
    pub fn profile(&self) -> Arc<RwLock<ProfileRecord>> {
        Arc::clone(&self.profile)
    }
}

/// Events accepted by the hub loop, FIFO across all kinds.
pub enum HubEvent {
    Register(Session),
    Unregister(SessionId),
    /// A serialized wire frame to fan out (and persist, if chat-kind).
    Dispatch(String),
    /// A connected account's profile changed; `previous_email` is its
    /// identifier from before the change.
    IdentityChanged { previous_email: String },
    /// Read-only state query, used by `/health` and tests. Because the
    /// mailbox is FIFO, the reply doubles as a barrier: every earlier
    /// event has been fully processed.
    Snapshot {
        respond_to: oneshot::Sender<HubSnapshot>,
    },
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct HubSnapshot {
    pub sessions: usize,
    pub history_len: usize,
}

/// Cloneable submission handle for the hub mailbox.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    pub async fn register(&self, session: Session) -> Result<(), HubError> {
        self.send(HubEvent::Register(session)).await
    }

    pub async fn unregister(&self, id: SessionId) -> Result<(), HubError> {
        self.send(HubEvent::Unregister(id)).await
    }

    pub async fn dispatch(&self, raw: String) -> Result<(), HubError> {
        self.send(HubEvent::Dispatch(raw)).await
    }

    pub async fn notify_identity_changed(
        &self,
        previous_email: impl Into<String>,
    ) -> Result<(), HubError> {
        self.send(HubEvent::IdentityChanged {
            previous_email: previous_email.into(),
        })
        .await
    }

    pub async fn snapshot(&self) -> Result<HubSnapshot, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubEvent::Snapshot { respond_to: tx }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, event: HubEvent) -> Result<(), HubError> {
        self.tx.send(event).await.map_err(|_| HubError::Closed)
    }
}

/// The coordinator. Runs for the lifetime of the process; per-session
/// failures never terminate the loop.
pub struct Hub {
    registry: HashMap<SessionId, Session>,
    history: History,
    identities: Arc<dyn IdentityStore>,
    rx: mpsc::Receiver<HubEvent>,
}

impl Hub {
    /// Spawn the hub task and return its submission handle.
    pub fn spawn(identities: Arc<dyn IdentityStore>) -> HubHandle {
        let (tx, rx) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let hub = Hub {
            registry: HashMap::new(),
            history: History::new(),
            identities,
            rx,
        };
        tokio::spawn(hub.run());
        HubHandle { tx }
    }

    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event);
        }
        debug!("hub mailbox closed, loop exiting");
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(session) => self.register(session),
            HubEvent::Unregister(id) => self.unregister(&id),
            HubEvent::Dispatch(raw) => self.dispatch(raw),
            HubEvent::IdentityChanged { previous_email } => {
                self.identity_changed(&previous_email);
            }
            HubEvent::Snapshot { respond_to } => {
                let _ = respond_to.send(HubSnapshot {
                    sessions: self.registry.len(),
                    history_len: self.history.len(),
                });
            }
        }
    }

    /// Add a session to the registry, replaying current history to it
    /// (and only it) first. The replay is a single best-effort try-send;
    /// a full queue drops the frame rather than stalling the loop.
    fn register(&mut self, session: Session) {
        {
            let profile = session.profile.read();
            info!(
                session_id = %session.id,
                username = %profile.username,
                email = %profile.email,
                "session registered"
            );
        }

        if !self.history.is_empty() {
            let frame = HistoryFrame::new(self.history.snapshot());
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if session.tx.try_send(json).is_err() {
                        warn!(session_id = %session.id, "history frame dropped");
                    }
                }
                Err(err) => warn!(%err, "failed to serialize history frame"),
            }
        }

        self.registry.insert(session.id.clone(), session);
    }

    /// Remove a session if present; dropping it closes its outbound
    /// queue, which terminates the write pump. Idempotent.
    fn unregister(&mut self, id: &SessionId) {
        if self.registry.remove(id).is_some() {
            info!(session_id = %id, "session unregistered");
        }
    }

    /// Persist (chat only) and fan out one serialized frame.
    fn dispatch(&mut self, raw: String) {
        let message: ChatMessage = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "dropping unparseable frame");
                return;
            }
        };

        if message.is_chat() {
            self.history.push(message);
        }

        self.broadcast(&raw);
    }

    /// Try-send to every registered session. A session whose queue is
    /// full (or whose pump is gone) is forcibly unregistered so one slow
    /// client can never stall delivery to the rest.
    fn broadcast(&mut self, raw: &str) {
        let mut stalled = Vec::new();
        for (id, session) in &self.registry {
            if session.tx.try_send(raw.to_owned()).is_err() {
                stalled.push(id.clone());
            }
        }
        for id in stalled {
            warn!(session_id = %id, "outbound queue saturated, disconnecting");
            self.registry.remove(&id);
        }
    }

    /// Reconcile a profile change with the live session that still
    /// carries the previous identifier. Best-effort: a missing session or
    /// missing record is a no-op (the account may have disconnected, or a
    /// second update may have raced this signal).
    fn identity_changed(&mut self, previous_email: &str) {
        let snapshot = self
            .registry
            .values()
            .find(|session| session.profile.read().email == previous_email)
            .map(Session::profile);

        let Some(snapshot) = snapshot else {
            debug!(previous_email, "identity change matched no live session");
            return;
        };

        let Some(record) = self.identities.lookup(previous_email) else {
            debug!(previous_email, "identity change matched no directory record");
            return;
        };

        info!(
            previous_email,
            email = %record.email,
            username = %record.username,
            "session identity refreshed"
        );
        *snapshot.write() = record.clone();

        let frame = UserUpdateFrame::new(previous_email, &record);
        match serde_json::to_string(&frame) {
            Ok(json) => self.dispatch(json),
            Err(err) => warn!(%err, "failed to serialize user_update frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banter_core::messages::MessageKind;
    use std::collections::HashMap;

    struct TestStore(HashMap<String, ProfileRecord>);

    impl TestStore {
        fn empty() -> Arc<Self> {
            Arc::new(Self(HashMap::new()))
        }

        fn with(records: &[ProfileRecord]) -> Arc<Self> {
            Arc::new(Self(
                records
                    .iter()
                    .map(|r| (r.email.clone(), r.clone()))
                    .collect(),
            ))
        }
    }

    impl IdentityStore for TestStore {
        fn lookup(&self, account: &str) -> Option<ProfileRecord> {
            self.0.get(account).cloned()
        }
    }

    fn profile(email: &str, username: &str) -> ProfileRecord {
        ProfileRecord {
            email: email.into(),
            username: username.into(),
            photo_url: format!("/uploads/{username}.jpg"),
        }
    }

    fn chat_json(sender: &ProfileRecord, text: &str) -> String {
        serde_json::to_string(&ChatMessage::outgoing(sender, text)).unwrap()
    }

    #[tokio::test]
    async fn register_with_empty_history_sends_nothing() {
        let hub = Hub::spawn(TestStore::empty());
        let (session, mut rx) = Session::new(profile("a@x.com", "a"), 8);
        hub.register(session).await.unwrap();

        let state = hub.snapshot().await.unwrap();
        assert_eq!(state.sessions, 1);
        assert_eq!(state.history_len, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn chat_is_broadcast_and_persisted() {
        let hub = Hub::spawn(TestStore::empty());
        let sender = profile("a@x.com", "a");
        let (session, mut rx) = Session::new(sender.clone(), 8);
        hub.register(session).await.unwrap();

        let raw = chat_json(&sender, "hi");
        hub.dispatch(raw.clone()).await.unwrap();

        let state = hub.snapshot().await.unwrap();
        assert_eq!(state.history_len, 1);

        let received = rx.try_recv().unwrap();
        assert_eq!(received, raw);
        let message: ChatMessage = serde_json::from_str(&received).unwrap();
        assert_eq!(message.username, "a");
        assert_eq!(message.text, "hi");
    }

    #[tokio::test]
    async fn late_joiner_gets_one_history_frame_others_get_nothing() {
        let hub = Hub::spawn(TestStore::empty());
        let sender = profile("a@x.com", "a");
        let (s1, mut rx1) = Session::new(sender.clone(), 8);
        hub.register(s1).await.unwrap();
        hub.dispatch(chat_json(&sender, "hi")).await.unwrap();

        let (s2, mut rx2) = Session::new(profile("b@x.com", "b"), 8);
        hub.register(s2).await.unwrap();
        hub.snapshot().await.unwrap();

        // S1: the live chat frame, and nothing else.
        let first: ChatMessage = serde_json::from_str(&rx1.try_recv().unwrap()).unwrap();
        assert_eq!(first.kind, MessageKind::Chat);
        assert!(rx1.try_recv().is_err());

        // S2: exactly one history frame containing the full buffer.
        let frame: HistoryFrame = serde_json::from_str(&rx2.try_recv().unwrap()).unwrap();
        assert_eq!(frame.kind, MessageKind::History);
        assert_eq!(frame.data.len(), 1);
        assert_eq!(frame.data[0].text, "hi");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_order_is_identical_for_all_recipients() {
        let hub = Hub::spawn(TestStore::empty());
        let sender = profile("a@x.com", "a");
        let (s1, mut rx1) = Session::new(sender.clone(), 8);
        let (s2, mut rx2) = Session::new(profile("b@x.com", "b"), 8);
        hub.register(s1).await.unwrap();
        hub.register(s2).await.unwrap();

        for text in ["one", "two", "three"] {
            hub.dispatch(chat_json(&sender, text)).await.unwrap();
        }
        hub.snapshot().await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            for expected in ["one", "two", "three"] {
                let message: ChatMessage =
                    serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
                assert_eq!(message.text, expected);
            }
        }
    }

    #[tokio::test]
    async fn session_registered_after_dispatch_sees_it_only_via_history() {
        let hub = Hub::spawn(TestStore::empty());
        let sender = profile("a@x.com", "a");
        hub.dispatch(chat_json(&sender, "early")).await.unwrap();

        let (session, mut rx) = Session::new(profile("b@x.com", "b"), 8);
        hub.register(session).await.unwrap();
        hub.snapshot().await.unwrap();

        let frame: HistoryFrame = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.data.len(), 1);
        assert_eq!(frame.data[0].text, "early");
        // No duplicate live delivery.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn saturated_queue_forces_unregister_without_stalling_others() {
        let hub = Hub::spawn(TestStore::empty());
        let sender = profile("a@x.com", "a");
        let (slow, _slow_rx) = Session::new(profile("s@x.com", "slow"), 2);
        let (ok, mut ok_rx) = Session::new(sender.clone(), 8);
        hub.register(slow).await.unwrap();
        hub.register(ok).await.unwrap();

        // The slow receiver never drains; its queue holds 2, so the third
        // broadcast fails fast and evicts it.
        for text in ["one", "two", "three"] {
            hub.dispatch(chat_json(&sender, text)).await.unwrap();
        }

        let state = hub.snapshot().await.unwrap();
        assert_eq!(state.sessions, 1);
        for expected in ["one", "two", "three"] {
            let message: ChatMessage =
                serde_json::from_str(&ok_rx.try_recv().unwrap()).unwrap();
            assert_eq!(message.text, expected);
        }
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_closes_the_queue() {
        let hub = Hub::spawn(TestStore::empty());
        let (session, mut rx) = Session::new(profile("a@x.com", "a"), 8);
        let id = session.id().clone();
        hub.register(session).await.unwrap();

        hub.unregister(id.clone()).await.unwrap();
        // Dropping the registry entry closes the outbound queue.
        assert!(rx.recv().await.is_none());

        // Unregistering again, or a never-registered id, is a no-op.
        hub.unregister(id).await.unwrap();
        hub.unregister(SessionId::new()).await.unwrap();
        assert_eq!(hub.snapshot().await.unwrap().sessions, 0);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_entirely() {
        let hub = Hub::spawn(TestStore::empty());
        let (session, mut rx) = Session::new(profile("a@x.com", "a"), 8);
        hub.register(session).await.unwrap();

        hub.dispatch("{not json".into()).await.unwrap();

        let state = hub.snapshot().await.unwrap();
        assert_eq!(state.history_len, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_chat_frame_broadcasts_without_persisting() {
        let hub = Hub::spawn(TestStore::empty());
        let (session, mut rx) = Session::new(profile("a@x.com", "a"), 8);
        hub.register(session).await.unwrap();

        hub.dispatch(r#"{"type":"presence","text":"x"}"#.into())
            .await
            .unwrap();

        let state = hub.snapshot().await.unwrap();
        assert_eq!(state.history_len, 0);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn history_retains_only_the_last_hundred() {
        let hub = Hub::spawn(TestStore::empty());
        let sender = profile("a@x.com", "a");
        for i in 1..=101 {
            hub.dispatch(chat_json(&sender, &format!("msg {i}")))
                .await
                .unwrap();
        }
        assert_eq!(hub.snapshot().await.unwrap().history_len, 100);

        // The replay a joiner sees starts at message #2.
        let (session, mut rx) = Session::new(profile("b@x.com", "b"), 8);
        hub.register(session).await.unwrap();
        hub.snapshot().await.unwrap();
        let frame: HistoryFrame = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.data[0].text, "msg 2");
        assert_eq!(frame.data[99].text, "msg 101");
    }

    #[tokio::test]
    async fn identity_change_with_no_matching_session_is_a_noop() {
        let hub = Hub::spawn(TestStore::with(&[profile("a@x.com", "a")]));
        let (session, mut rx) = Session::new(profile("b@x.com", "b"), 8);
        hub.register(session).await.unwrap();

        hub.notify_identity_changed("a@x.com").await.unwrap();

        hub.snapshot().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn identity_change_refreshes_snapshot_and_broadcasts() {
        // The store already holds the post-update record, resolvable by
        // the previous identifier.
        let updated = profile("new@x.com", "renamed");
        let store = Arc::new(TestStore(HashMap::from([(
            "old@x.com".to_owned(),
            updated.clone(),
        )])));
        let hub = Hub::spawn(store);

        let (session, mut rx) = Session::new(profile("old@x.com", "original"), 8);
        let snapshot = session.profile();
        hub.register(session).await.unwrap();

        hub.notify_identity_changed("old@x.com").await.unwrap();
        hub.snapshot().await.unwrap();

        let frame: UserUpdateFrame = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame.kind, MessageKind::UserUpdate);
        assert_eq!(frame.old_email, "old@x.com");
        assert_eq!(frame.new_email, "new@x.com");
        assert_eq!(frame.username, "renamed");

        // The cached snapshot now carries the new identity, so the next
        // inbound message is stamped with it.
        assert_eq!(snapshot.read().email, "new@x.com");
        assert_eq!(snapshot.read().username, "renamed");
    }

    #[tokio::test]
    async fn user_update_is_not_persisted_to_history() {
        let store = Arc::new(TestStore(HashMap::from([(
            "old@x.com".to_owned(),
            profile("new@x.com", "renamed"),
        )])));
        let hub = Hub::spawn(store);
        let (session, _rx) = Session::new(profile("old@x.com", "original"), 8);
        hub.register(session).await.unwrap();

        hub.notify_identity_changed("old@x.com").await.unwrap();
        assert_eq!(hub.snapshot().await.unwrap().history_len, 0);
    }
}
