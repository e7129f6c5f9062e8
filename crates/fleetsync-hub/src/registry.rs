use crate::identity::ResolvedIdentity;
use crate::session::{ChannelHandle, Session, SessionCommand, SessionContext};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("identity {identity} is bound to organization {bound}, not {requested}")]
    OrganizationMismatch {
        identity: String,
        bound: String,
        requested: String,
    },
    #[error("no live session for identity {0}")]
    UnknownIdentity(String),
    #[error("session for identity {0} has stopped")]
    SessionClosed(String),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::OrganizationMismatch { .. } => "organization_mismatch",
            RegistryError::UnknownIdentity(_) => "unknown_identity",
            RegistryError::SessionClosed(_) => "session_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub identities: usize,
    pub channels: usize,
}

struct IdentityEntry {
    organization: String,
    commands: mpsc::Sender<SessionCommand>,
    channels: HashSet<String>,
}

/// Tracks which channels are bound to which identity and owns the command
/// side of every identity's session task.
pub struct ConnectionRegistry {
    context: SessionContext,
    identities: Mutex<HashMap<String, IdentityEntry>>,
}

impl ConnectionRegistry {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            identities: Mutex::new(HashMap::new()),
        }
    }

    /// Binds a channel to its identity, starting a session on first connect.
    /// A different organization claim for a live identity is rejected.
    pub async fn connect(
        &self,
        who: &ResolvedIdentity,
        channel: ChannelHandle,
    ) -> Result<(), RegistryError> {
        let mut identities = self.identities.lock().await;

        if let Some(entry) = identities.get_mut(&who.identity) {
            if entry.organization != who.organization {
                warn!(
                    event = "organization_mismatch",
                    identity = %who.identity,
                    bound = %entry.organization,
                    requested = %who.organization
                );
                return Err(RegistryError::OrganizationMismatch {
                    identity: who.identity.clone(),
                    bound: entry.organization.clone(),
                    requested: who.organization.clone(),
                });
            }
            let channel_id = channel.channel_id.clone();
            if entry
                .commands
                .send(SessionCommand::Attach(channel.clone()))
                .await
                .is_ok()
            {
                entry.channels.insert(channel_id.clone());
                info!(
                    event = "channel_joined",
                    identity = %who.identity,
                    channel_id = %channel_id,
                    channels = entry.channels.len()
                );
                return Ok(());
            }
            warn!(event = "session_respawn", identity = %who.identity);
        }

        let channel_id = channel.channel_id.clone();
        let (commands, _handle) = Session::spawn(
            who.identity.clone(),
            who.organization.clone(),
            channel,
            self.context.clone(),
        );
        identities.insert(
            who.identity.clone(),
            IdentityEntry {
                organization: who.organization.clone(),
                commands,
                channels: HashSet::from([channel_id.clone()]),
            },
        );
        info!(
            event = "identity_connected",
            identity = %who.identity,
            organization = %who.organization,
            channel_id = %channel_id
        );
        Ok(())
    }

    /// Unbinds a channel. The identity's state is dropped with its last
    /// channel, which also cancels its pending timer.
    pub async fn disconnect(&self, identity: &str, channel_id: &str) {
        let mut identities = self.identities.lock().await;
        let Some(entry) = identities.get_mut(identity) else {
            return;
        };
        if !entry.channels.remove(channel_id) {
            return;
        }
        let _ = entry
            .commands
            .send(SessionCommand::Detach {
                channel_id: channel_id.to_string(),
            })
            .await;
        if entry.channels.is_empty() {
            identities.remove(identity);
            info!(event = "identity_disconnected", identity = identity);
        } else {
            debug!(
                event = "channel_left",
                identity = identity,
                channel_id = channel_id,
                remaining = entry.channels.len()
            );
        }
    }

    pub async fn command(&self, identity: &str, command: SessionCommand) -> Result<(), RegistryError> {
        let sender = {
            let identities = self.identities.lock().await;
            identities
                .get(identity)
                .map(|entry| entry.commands.clone())
                .ok_or_else(|| RegistryError::UnknownIdentity(identity.to_string()))?
        };
        sender
            .send(command)
            .await
            .map_err(|_| RegistryError::SessionClosed(identity.to_string()))
    }

    /// Queues a manual refresh on every live identity. Returns how many
    /// sessions accepted it.
    pub async fn refresh_all(&self) -> usize {
        let identities = self.identities.lock().await;
        let mut accepted = 0;
        for (identity, entry) in identities.iter() {
            match entry.commands.try_send(SessionCommand::ManualRefresh) {
                Ok(()) => accepted += 1,
                Err(err) => warn!(event = "refresh_all_skipped", identity = %identity, error = %err),
            }
        }
        info!(event = "refresh_all", sessions = accepted);
        accepted
    }

    pub async fn stats(&self) -> RegistryStats {
        let identities = self.identities.lock().await;
        RegistryStats {
            identities: identities.len(),
            channels: identities.values().map(|entry| entry.channels.len()).sum(),
        }
    }

    pub async fn is_connected(&self, identity: &str) -> bool {
        self.identities.lock().await.contains_key(identity)
    }
}
