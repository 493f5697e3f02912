use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    attach::AttachService,
    config::{Config, StoreBackend},
    dispatch::{DispatchEngine, DispatchError},
    push::{PushTransport, WebPushTransport},
    reminder::ReminderScanner,
    store::{
        firestore::FirestoreStore, memory::MemoryStore, DueItemSource, SubscriptionStore,
        ThrottleLedger,
    },
};

#[derive(Clone)]
enum Backend {
    Memory(Arc<MemoryStore>),
    Firestore(Arc<FirestoreStore>),
}

type Stores = (
    Arc<dyn SubscriptionStore>,
    Arc<dyn ThrottleLedger>,
    Arc<dyn DueItemSource>,
);

fn split<S>(store: &Arc<S>) -> Stores
where
    S: SubscriptionStore + ThrottleLedger + DueItemSource + 'static,
{
    (store.clone(), store.clone(), store.clone())
}

/// Everything a request or a CLI command needs, built once per process.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub ledger: Arc<dyn ThrottleLedger>,
    pub items: Arc<dyn DueItemSource>,
    engine: Option<Arc<DispatchEngine>>,
    backend: Backend,
}

impl ServerState {
    pub async fn init(config: Config) -> Result<Self> {
        let backend = match config.store {
            StoreBackend::Memory => Backend::Memory(Arc::new(MemoryStore::default())),
            StoreBackend::Firestore => {
                let project_id = config
                    .gcp_project_id
                    .as_deref()
                    .context("Expected GCP_PROJECT_ID env var.")?;
                Backend::Firestore(Arc::new(FirestoreStore::new(
                    project_id,
                    &config.due_collection,
                )?))
            }
        };

        let transport = match &config.vapid_privkey {
            Some(privkey) => {
                let transport: Arc<dyn PushTransport> = Arc::new(
                    WebPushTransport::new(privkey, &config.vapid_subject, config.send_timeout)
                        .context("Could not build push transport")?,
                );
                Some(transport)
            }
            None => None,
        };

        tracing::info!(store = ?config.store, sending = transport.is_some(), "State initialised.");
        Ok(Self::assemble(config, backend, transport))
    }

    /// In-memory state with an explicit transport, for tests and local runs.
    pub fn in_memory(
        config: Config,
        store: Arc<MemoryStore>,
        transport: Option<Arc<dyn PushTransport>>,
    ) -> Self {
        Self::assemble(config, Backend::Memory(store), transport)
    }

    fn assemble(
        config: Config,
        backend: Backend,
        transport: Option<Arc<dyn PushTransport>>,
    ) -> Self {
        let (subscriptions, ledger, items) = match &backend {
            Backend::Memory(store) => split(store),
            Backend::Firestore(store) => split(store),
        };

        let engine = transport.map(|transport| {
            Arc::new(DispatchEngine::new(
                transport,
                subscriptions.clone(),
                config.send_concurrency,
                config.send_timeout,
            ))
        });

        ServerState {
            config: Arc::new(config),
            subscriptions,
            ledger,
            items,
            engine,
            backend,
        }
    }

    pub fn engine(&self) -> Result<Arc<DispatchEngine>, DispatchError> {
        self.engine.clone().ok_or(DispatchError::Misconfigured)
    }

    pub fn scanner(&self) -> Result<ReminderScanner, DispatchError> {
        Ok(ReminderScanner::new(
            self.engine()?,
            self.subscriptions.clone(),
            self.ledger.clone(),
            self.items.clone(),
            self.config.utc_offset,
            self.config.push_ttl_secs,
        ))
    }

    pub fn attach_service(&self) -> Arc<AttachService> {
        Arc::new(AttachService::new(
            self.subscriptions.clone(),
            self.engine.clone(),
        ))
    }

    pub fn shutdown(&self) {
        match &self.backend {
            Backend::Memory(_) => {}
            Backend::Firestore(store) => store.close(),
        }
        tracing::info!("State shut down.");
    }
}
