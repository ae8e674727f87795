//! Shared application state.
//!
//! One [`AppState`] is built at startup and shared by every route through
//! `Arc`. It owns the configuration, the session directory, the processor
//! factory, and the WebSocket connection counters used by the
//! connection-limit middleware.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::core::processor::{LoopbackFactory, ProcessorFactory};
use crate::core::session::{InMemorySessionDirectory, SessionDirectory};

/// Why a WebSocket connection slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionLimitError {
    #[error("global WebSocket connection limit reached")]
    GlobalLimitReached,
    #[error("per-IP WebSocket connection limit reached")]
    PerIpLimitReached,
}

pub struct AppState {
    pub config: ServerConfig,
    pub directory: Arc<dyn SessionDirectory>,
    pub processor_factory: Arc<dyn ProcessorFactory>,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, u32>,
}

impl AppState {
    /// Build the default state: an in-memory directory seeded from the
    /// configuration and the loopback processor.
    pub async fn new(config: ServerConfig) -> Arc<Self> {
        let directory = InMemorySessionDirectory::new();
        for session in &config.seeded_sessions {
            directory.insert(session.clone());
        }
        info!(
            seeded_sessions = directory.len(),
            model = %config.processor_model,
            "Initialized in-memory session directory"
        );

        let factory = LoopbackFactory::new(config.loopback_config());
        Self::with_components(config, Arc::new(directory), Arc::new(factory))
    }

    /// Build state around externally supplied backends.
    pub fn with_components(
        config: ServerConfig,
        directory: Arc<dyn SessionDirectory>,
        processor_factory: Arc<dyn ProcessorFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            directory,
            processor_factory,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        })
    }

    /// Reserve a connection slot for `ip`.
    ///
    /// The per-IP entry stays locked while the global counter is updated, so
    /// two upgrades from the same address cannot both pass the per-IP check.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let result = {
            let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
            if *per_ip >= self.config.max_connections_per_ip {
                Err(ConnectionLimitError::PerIpLimitReached)
            } else {
                let max = self.config.max_websocket_connections;
                let acquired = self.ws_connections.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |current| match max {
                        Some(max) if current >= max => None,
                        _ => Some(current + 1),
                    },
                );
                match acquired {
                    Ok(_) => {
                        *per_ip += 1;
                        Ok(())
                    }
                    Err(_) => Err(ConnectionLimitError::GlobalLimitReached),
                }
            }
        };

        if result.is_err() {
            self.ip_connections.remove_if(&ip, |_, count| *count == 0);
        }
        result
    }

    /// Release a slot previously acquired with [`Self::try_acquire_connection`].
    pub fn release_connection(&self, ip: IpAddr) {
        let released = match self.ip_connections.get_mut(&ip) {
            Some(mut count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        };
        self.ip_connections.remove_if(&ip, |_, count| *count == 0);

        if !released {
            debug!(ip = %ip, "Release for an address without an active connection");
            return;
        }

        let _ = self
            .ws_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> u32 {
        self.ip_connections.get(ip).map(|count| *count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::core::session::Session;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_new_seeds_directory() {
        let mut config = test_config();
        config.seeded_sessions = vec![Session::new("sess-1", "user-1", "chat-1")];

        let state = AppState::new(config).await;
        let found = state.directory.lookup("sess-1").await.unwrap();
        assert!(found.is_some());
        assert!(state.directory.lookup("sess-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_acquire_leaves_no_entry() {
        let mut config = test_config();
        config.max_websocket_connections = Some(0);
        let state = AppState::new(config).await;
        let ip: IpAddr = Ipv4Addr::new(10, 0, 0, 1).into();

        assert_eq!(
            state.try_acquire_connection(ip),
            Err(ConnectionLimitError::GlobalLimitReached)
        );
        assert_eq!(state.ip_connection_count(&ip), 0);
        assert!(state.ip_connections.is_empty());
    }

    #[tokio::test]
    async fn test_release_without_acquire_is_noop() {
        let state = AppState::new(test_config()).await;
        let ip: IpAddr = Ipv4Addr::new(10, 0, 0, 2).into();

        state.release_connection(ip);
        assert_eq!(state.ws_connection_count(), 0);

        state.try_acquire_connection(ip).unwrap();
        state.release_connection(ip);
        state.release_connection(ip);
        assert_eq!(state.ws_connection_count(), 0);
        assert_eq!(state.ip_connection_count(&ip), 0);
    }
}
