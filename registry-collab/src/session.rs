//! Session coordinator: one site editing one document.
//!
//! ```text
//!  UI edit ──► apply_local ──► DocumentState ──► listeners
//!                                   │
//!                                   └──► Transport.publish("collab:{doc}")
//!
//!  Transport ──► on_remote_message ──► Transformer ──► DocumentState ──► listeners
//!
//!  lock_section / unlock_section ──► KeyValueStore (set-if-absent, lease)
//!  save_version / load_version   ──► KeyValueStore (snapshot, 30 day TTL)
//! ```
//!
//! Everything takes `&mut self`: buffer mutation is synchronous and finishes
//! before the next await, so edits never interleave within a session. Sessions
//! on other sites only meet through the transport and the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{now_millis, SiteClock};
use crate::document::DocumentState;
use crate::events::{
    ChangeOrigin, CursorChange, DocumentChange, ListenerRegistry, SelectionChange, Subscription,
};
use crate::operation::{LocalEdit, Operation, OperationError};
use crate::presence::{CursorColor, PresenceMap};
use crate::protocol::CollabMessage;
use crate::storage::{lock_key, version_key, KeyValueStore, StoreError};
use crate::transform::{Transformer, WindowPolicy};
use crate::transport::{document_channel, MessageStream, Transport, TransportError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Which applied operations incoming remote operations are transformed against
    pub window: WindowPolicy,
    /// Section lock lease (default: 300s)
    pub lock_lease: Duration,
    /// Saved version lifetime (default: 30 days)
    pub version_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window: WindowPolicy::default(),
            lock_lease: Duration::from_secs(300),
            version_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl SessionConfig {
    /// Short lease so expiry can be observed in tests.
    pub fn for_testing() -> Self {
        Self {
            window: WindowPolicy::default(),
            lock_lease: Duration::from_secs(5),
            version_ttl: Duration::from_secs(60),
        }
    }

    pub fn with_window(mut self, window: WindowPolicy) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Connected,
    Closed,
}

/// Counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub local_ops: u64,
    pub remote_applied: u64,
    /// Remote operations already in the log
    pub duplicates_dropped: u64,
    /// Own operations seen coming back from the transport
    pub confirmed_deliveries: u64,
    pub publish_failures: u64,
    pub foreign_document_messages: u64,
}

/// Saved copy of buffer and log. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub document: String,
    pub operations: Vec<Operation>,
    /// Unix millis at save time
    pub timestamp: u64,
}

impl VersionSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(snapshot)
    }
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is not connected (state: {0:?})")]
    NotConnected(SessionState),
    #[error("Invalid section range {start}..{end}")]
    InvalidRange { start: usize, end: usize },
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One site's view of one shared document.
pub struct CollabSession {
    site_id: String,
    document_id: String,
    channel: String,
    state: SessionState,
    config: SessionConfig,
    document: DocumentState,
    transformer: Transformer,
    presence: PresenceMap,
    /// Section locks known to this site, `(start, end)` → holder
    section_locks: HashMap<(usize, usize), String>,
    saved_versions: Vec<String>,
    clock: SiteClock,
    transport: Arc<dyn Transport>,
    store: Arc<dyn KeyValueStore>,
    inbox: Option<MessageStream>,
    document_listeners: ListenerRegistry<DocumentChange>,
    cursor_listeners: ListenerRegistry<CursorChange>,
    selection_listeners: ListenerRegistry<SelectionChange>,
    stats: SessionStats,
}

impl CollabSession {
    /// Open `document_id` with an empty buffer.
    pub async fn open(
        site_id: impl Into<String>,
        document_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        Self::open_with_text(site_id, document_id, "", transport, store, config).await
    }

    /// Open `document_id` starting from `initial_text`.
    ///
    /// Subscribes to the document channel before returning; a subscription
    /// failure leaves no usable session behind.
    pub async fn open_with_text(
        site_id: impl Into<String>,
        document_id: impl Into<String>,
        initial_text: impl Into<String>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let site_id = site_id.into();
        let document_id = document_id.into();
        let channel = document_channel(&document_id);

        let mut session = Self {
            presence: PresenceMap::new(site_id.clone()),
            transformer: Transformer::new(config.window),
            document: DocumentState::with_text(initial_text),
            site_id,
            document_id,
            channel,
            state: SessionState::Initializing,
            config,
            section_locks: HashMap::new(),
            saved_versions: Vec::new(),
            clock: SiteClock::new(),
            transport,
            store,
            inbox: None,
            document_listeners: ListenerRegistry::new(),
            cursor_listeners: ListenerRegistry::new(),
            selection_listeners: ListenerRegistry::new(),
            stats: SessionStats::default(),
        };

        let inbox = session.transport.subscribe(&session.channel).await.map_err(|e| {
            log::error!("Site {} failed to subscribe to {}: {e}", session.site_id, session.channel);
            e
        })?;
        session.inbox = Some(inbox);
        session.state = SessionState::Connected;
        log::info!(
            "Site {} joined document {} ({} chars)",
            session.site_id,
            session.document_id,
            session.document.char_len()
        );
        Ok(session)
    }

    // ─── Editing ──────────────────────────────────────────────────────

    /// Apply an edit made on this site and publish it. Returns the operation id.
    ///
    /// The edit is committed locally even if publishing fails; the failure is
    /// logged and counted in [`SessionStats::publish_failures`].
    ///
    /// A caller-supplied id must be new to this document. A caller-supplied
    /// timestamp is moved forward if it is not later than this site's previous
    /// operation.
    pub async fn apply_local(&mut self, edit: LocalEdit) -> Result<String, SessionError> {
        self.ensure_connected()?;
        edit.validate()?;
        if let Some(id) = edit.id.as_deref() {
            if self.document.has_applied(id) {
                return Err(OperationError::DuplicateId(id.to_string()).into());
            }
        }

        let timestamp = match edit.timestamp {
            Some(requested) => self.clock.advance_to(requested),
            None => self.clock.tick(),
        };
        let edit = LocalEdit {
            timestamp: Some(timestamp),
            ..edit
        };
        let mut op = self
            .document
            .clamp(edit.into_operation(&self.site_id, timestamp)?);
        op.set_seen(self.document.frontier_excluding(&self.site_id));
        let id = op.id().to_string();

        self.document.apply(op.clone());
        self.stats.local_ops += 1;
        log::debug!(
            "Site {} applied local {} {id} at {}",
            self.site_id,
            op.kind().as_str(),
            op.position()
        );
        self.document_listeners.emit(&DocumentChange {
            text: self.document.text().to_string(),
            operation: Some(op.clone()),
            origin: ChangeOrigin::Local,
        });

        let message = CollabMessage::Operation {
            document_id: self.document_id.clone(),
            site_id: self.site_id.clone(),
            operation: op,
        };
        self.publish_committed(&message, &id).await;
        Ok(id)
    }

    /// Handle one message from the document channel.
    pub fn on_remote_message(&mut self, message: CollabMessage) -> Result<(), SessionError> {
        self.ensure_connected()?;
        if message.document_id() != self.document_id {
            self.stats.foreign_document_messages += 1;
            log::trace!(
                "Site {} ignoring message for document {}",
                self.site_id,
                message.document_id()
            );
            return Ok(());
        }

        match message {
            CollabMessage::Operation { operation, .. } => {
                self.on_remote_operation(operation)?;
            }
            CollabMessage::CursorUpdate {
                site_id,
                position,
                color,
                ..
            } => {
                if self.presence.update_cursor(&site_id, position, color) {
                    self.cursor_listeners.emit(&CursorChange {
                        site_id,
                        position,
                        color,
                    });
                }
            }
            CollabMessage::SelectionUpdate {
                site_id,
                start,
                end,
                color,
                ..
            } => {
                if self.presence.update_selection(&site_id, start, end, color) {
                    self.selection_listeners.emit(&SelectionChange {
                        site_id,
                        start: start.min(end),
                        end: start.max(end),
                        color,
                    });
                }
            }
            CollabMessage::SectionLocked {
                holder, start, end, ..
            } => {
                log::debug!("Section {start}..{end} of {} locked by {holder}", self.document_id);
                self.section_locks.insert((start, end), holder);
            }
            CollabMessage::SectionUnlocked {
                holder, start, end, ..
            } => {
                if self.section_locks.get(&(start, end)) == Some(&holder) {
                    self.section_locks.remove(&(start, end));
                }
                log::debug!("Section {start}..{end} of {} released by {holder}", self.document_id);
            }
        }
        Ok(())
    }

    /// Integrate an operation from another site. Returns whether the buffer
    /// log grew (`false` for duplicates and own echoes).
    pub fn on_remote_operation(&mut self, operation: Operation) -> Result<bool, SessionError> {
        self.ensure_connected()?;

        if operation.author_site_id() == self.site_id {
            self.stats.confirmed_deliveries += 1;
            log::trace!("Site {} confirmed delivery of {}", self.site_id, operation.id());
            return Ok(false);
        }
        if self.document.has_applied(operation.id()) {
            self.stats.duplicates_dropped += 1;
            log::debug!("Site {} dropped duplicate {}", self.site_id, operation.id());
            return Ok(false);
        }

        let original_position = operation.position();
        let transformed = self.transformer.transform_for(&self.document, operation);
        if transformed.position() != original_position {
            log::trace!(
                "Transformed {} from {original_position} to {}",
                transformed.id(),
                transformed.position()
            );
        }

        self.document.apply(transformed.clone());
        self.stats.remote_applied += 1;
        self.document_listeners.emit(&DocumentChange {
            text: self.document.text().to_string(),
            operation: Some(transformed),
            origin: ChangeOrigin::Remote,
        });
        Ok(true)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Broadcast this site's caret.
    pub async fn update_cursor(
        &mut self,
        position: usize,
        color: CursorColor,
    ) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let message = CollabMessage::CursorUpdate {
            document_id: self.document_id.clone(),
            site_id: self.site_id.clone(),
            position,
            color,
        };
        self.publish(&message).await?;
        Ok(())
    }

    /// Broadcast this site's selection.
    pub async fn update_selection(
        &mut self,
        start: usize,
        end: usize,
        color: CursorColor,
    ) -> Result<(), SessionError> {
        self.ensure_connected()?;
        let message = CollabMessage::SelectionUpdate {
            document_id: self.document_id.clone(),
            site_id: self.site_id.clone(),
            start,
            end,
            color,
        };
        self.publish(&message).await?;
        Ok(())
    }

    /// Forget peers that have been silent longer than `timeout`.
    pub fn prune_idle_peers(&mut self, timeout: Duration) -> Vec<String> {
        let pruned = self.presence.prune_idle(timeout);
        if !pruned.is_empty() {
            log::debug!("Site {} pruned idle peers {pruned:?}", self.site_id);
        }
        pruned
    }

    // ─── Section locks ────────────────────────────────────────────────

    /// Try to take the advisory lock on `start..end` for `actor`.
    ///
    /// Returns `Ok(false)` if another actor holds it. Re-locking one's own
    /// section succeeds and refreshes the lease. Once the store has granted
    /// the lock a failed broadcast is only logged and counted.
    pub async fn lock_section(
        &mut self,
        start: usize,
        end: usize,
        actor: &str,
    ) -> Result<bool, SessionError> {
        self.ensure_connected()?;
        check_range(start, end)?;

        let key = lock_key(&self.document_id, start, end);
        let lease = Some(self.config.lock_lease);
        let holder = actor.as_bytes().to_vec();

        let mut acquired = self.store.set(&key, holder.clone(), lease, true).await?;
        if !acquired
            && self
                .store
                .set_if_equals(&key, &holder, holder.clone(), lease)
                .await?
        {
            log::debug!("Refreshed lease on {key} for {actor}");
            acquired = true;
        }
        if !acquired {
            // The previous lease may have expired after the first attempt
            acquired = self.store.set(&key, holder, lease, true).await?;
        }
        if !acquired {
            log::debug!("Lock {key} denied to {actor}");
            return Ok(false);
        }

        self.section_locks.insert((start, end), actor.to_string());
        let message = CollabMessage::SectionLocked {
            document_id: self.document_id.clone(),
            site_id: self.site_id.clone(),
            holder: actor.to_string(),
            start,
            end,
        };
        self.publish_committed(&message, &key).await;
        log::info!("{actor} locked {start}..{end} of {}", self.document_id);
        Ok(true)
    }

    /// Release `start..end` if `actor` is the stored holder. As with
    /// [`lock_section`](Self::lock_section), the store decides the outcome.
    pub async fn unlock_section(
        &mut self,
        start: usize,
        end: usize,
        actor: &str,
    ) -> Result<bool, SessionError> {
        self.ensure_connected()?;
        check_range(start, end)?;

        let key = lock_key(&self.document_id, start, end);
        if !self.store.delete_if_equals(&key, actor.as_bytes()).await? {
            log::debug!("Unlock of {key} by {actor} refused");
            return Ok(false);
        }

        self.section_locks.remove(&(start, end));
        let message = CollabMessage::SectionUnlocked {
            document_id: self.document_id.clone(),
            site_id: self.site_id.clone(),
            holder: actor.to_string(),
            start,
            end,
        };
        self.publish_committed(&message, &key).await;
        log::info!("{actor} unlocked {start}..{end} of {}", self.document_id);
        Ok(true)
    }

    // ─── Versions ─────────────────────────────────────────────────────

    /// Persist a snapshot of the current buffer and log. Returns its id.
    pub async fn save_version(
        &mut self,
        name: &str,
        description: &str,
    ) -> Result<String, SessionError> {
        self.ensure_connected()?;

        let snapshot = VersionSnapshot {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            document: self.document.text().to_string(),
            operations: self.document.applied_log().to_vec(),
            timestamp: now_millis(),
        };
        let encoded = snapshot.encode()?;
        let key = version_key(&self.document_id, &snapshot.id);
        self.store
            .set(&key, encoded, Some(self.config.version_ttl), false)
            .await?;

        log::info!(
            "Saved version {} ({name}) of {}: {} ops",
            snapshot.id,
            self.document_id,
            snapshot.operations.len()
        );
        self.saved_versions.push(snapshot.id.clone());
        Ok(snapshot.id)
    }

    /// Replace buffer and log with a saved version. `Ok(false)` if it does not
    /// exist (or expired); nothing is changed then.
    pub async fn load_version(&mut self, version_id: &str) -> Result<bool, SessionError> {
        self.ensure_connected()?;

        let key = version_key(&self.document_id, version_id);
        let Some(bytes) = self.store.get(&key).await? else {
            log::debug!("Version {version_id} of {} not found", self.document_id);
            return Ok(false);
        };
        let snapshot = VersionSnapshot::decode(&bytes)?;

        self.document.reset(snapshot.document, snapshot.operations);
        log::info!("Restored version {version_id} of {}", self.document_id);
        self.document_listeners.emit(&DocumentChange {
            text: self.document.text().to_string(),
            operation: None,
            origin: ChangeOrigin::Restore,
        });
        Ok(true)
    }

    // ─── Event loop ───────────────────────────────────────────────────

    /// Wait for the next message on the document channel. `None` once
    /// disconnected or the transport closed.
    pub async fn next_message(&mut self) -> Option<CollabMessage> {
        self.inbox.as_mut()?.recv().await
    }

    /// Receive and handle one message. Returns `Ok(false)` when there is
    /// nothing more to receive.
    pub async fn process_next(&mut self) -> Result<bool, SessionError> {
        match self.next_message().await {
            Some(message) => {
                self.on_remote_message(message)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Handle every message already delivered, without waiting.
    pub fn drain_pending(&mut self) -> Result<usize, SessionError> {
        let mut handled = 0;
        loop {
            let Some(message) = self.inbox.as_mut().and_then(MessageStream::try_recv) else {
                break;
            };
            self.on_remote_message(message)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Leave the document. The buffer stays readable.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.inbox = None;
        self.state = SessionState::Closed;
        log::info!("Site {} left document {}", self.site_id, self.document_id);
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    pub fn on_document_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.document_listeners.subscribe(listener)
    }

    pub fn on_cursor_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CursorChange) + Send + Sync + 'static,
    {
        self.cursor_listeners.subscribe(listener)
    }

    pub fn on_selection_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SelectionChange) + Send + Sync + 'static,
    {
        self.selection_listeners.subscribe(listener)
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn text(&self) -> &str {
        self.document.text()
    }

    pub fn document(&self) -> &DocumentState {
        &self.document
    }

    pub fn presence(&self) -> &PresenceMap {
        &self.presence
    }

    /// Section locks this site knows about, `(start, end)` → holder.
    pub fn section_locks(&self) -> &HashMap<(usize, usize), String> {
        &self.section_locks
    }

    /// Ids of versions saved by this session, oldest first.
    pub fn saved_versions(&self) -> &[String] {
        &self.saved_versions
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connected => Ok(()),
            state => Err(SessionError::NotConnected(state)),
        }
    }

    async fn publish(&self, message: &CollabMessage) -> Result<(), TransportError> {
        self.transport.publish(&self.channel, message).await
    }

    /// Publish a change that is already committed locally or in the store.
    async fn publish_committed(&mut self, message: &CollabMessage, what: &str) {
        if let Err(e) = self.publish(message).await {
            self.stats.publish_failures += 1;
            log::error!(
                "Site {} failed to publish {} for {what}: {e}",
                self.site_id,
                message.message_type().as_str()
            );
        }
    }
}

impl std::fmt::Debug for CollabSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabSession")
            .field("site_id", &self.site_id)
            .field("document_id", &self.document_id)
            .field("state", &self.state)
            .field("applied", &self.document.applied_count())
            .finish()
    }
}

fn check_range(start: usize, end: usize) -> Result<(), SessionError> {
    if start >= end {
        return Err(SessionError::InvalidRange { start, end });
    }
    Ok(())
}
