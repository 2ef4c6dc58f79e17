pub use crate::database::{Database, DatabaseError};
pub use crate::error::{BackchannelError, Result};
pub use crate::event_store::{EventQuery, EventStore};
pub use crate::payments::{
    MintClient, PaymentSelector, SpendRequest, SpendResult, SpendStatus, WalletBackend,
};
pub use crate::relays::RelayManager;
pub use crate::sync::{SyncEngine, SyncPhase};
pub use crate::types::ProcessableEvent;

use crate::payments::{PendingTokenStore, RecipientDirectory, TransactionHistory};

use nostr_sdk::prelude::*;
use once_cell::sync::OnceCell;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

mod database;
mod error;
pub mod event_store;
pub mod payments;
pub mod relays;
pub mod sync;
pub mod types;

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("backchannel")
            .filename_suffix("log")
            .build(logs_dir)
            .expect("Failed to create file appender");

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .init();
    });
}

#[derive(Clone, Debug)]
pub struct BackchannelConfig {
    /// Directory for application data
    pub data_dir: PathBuf,

    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Relays used for conversation sync
    pub relays: Vec<RelayUrl>,
}

impl BackchannelConfig {
    pub fn new(data_dir: &Path, logs_dir: &Path, relays: Vec<RelayUrl>) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            data_dir: data_dir.join(env_suffix),
            logs_dir: logs_dir.join(env_suffix),
            relays,
        }
    }
}

/// The assembled chat-client core: conversation sync on one side, ecash
/// payments on the other. The inference call itself and all UI concerns live
/// outside; this type only hands them tokens and assembled conversations.
pub struct Backchannel {
    pub config: BackchannelConfig,
    pub(crate) database: Arc<Database>,
    pub store: Arc<EventStore>,
    pub sync: Arc<SyncEngine>,
    payments: PaymentSelector,
    recipients: Arc<RecipientDirectory>,
    event_sender: Sender<ProcessableEvent>,
    shutdown_sender: Sender<()>,
}

impl Backchannel {
    /// Initializes the core with the provided configuration.
    ///
    /// Sets up the data and log directories, configures logging, opens the
    /// database, wires the relay manager into the event processing channel
    /// and builds the sync engine and payment selector. `mint_client` is the
    /// caller's mint transport; selection and retry policy live here, the
    /// wire protocol does not.
    pub async fn initialize(
        config: BackchannelConfig,
        identity: Keys,
        mint_client: Arc<dyn MintClient>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.logs_dir)?;

        // Only initialize tracing once
        init_tracing(&config.logs_dir);
        tracing::debug!("Logging initialized in directory: {:?}", config.logs_dir);

        let database = Arc::new(Database::new(config.data_dir.join("backchannel.sqlite")).await?);

        // Event processing channels
        let (event_sender, event_receiver) = mpsc::channel(500);
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

        let relay_manager = Arc::new(RelayManager::new(event_sender.clone()).await?);
        let store = Arc::new(EventStore::new());
        let sync = Arc::new(SyncEngine::new(
            identity,
            config.relays.clone(),
            relay_manager,
            store.clone(),
        ));

        let recipients = Arc::new(RecipientDirectory::new());
        let pending = Arc::new(PendingTokenStore::load((*database).clone()).await?);
        let history = TransactionHistory::new((*database).clone());
        let payments = PaymentSelector::new(mint_client, recipients.clone(), pending, history);

        let backchannel = Self {
            config,
            database,
            store,
            sync,
            payments,
            recipients,
            event_sender,
            shutdown_sender,
        };

        // Start the event processing loop only when not running tests
        if !cfg!(test) {
            backchannel
                .start_event_processing_loop(event_receiver, shutdown_receiver)
                .await;
        }

        Ok(backchannel)
    }

    /// Mint selection, spend retry and pending-token policy.
    pub fn payments(&self) -> &PaymentSelector {
        &self.payments
    }

    /// Recipient metadata (accepted mints, wallet balance checks).
    pub fn recipients(&self) -> &RecipientDirectory {
        &self.recipients
    }

    /// Queue an event for processing, for collaborators that obtain events
    /// out of band.
    pub async fn queue_event(&self, event: ProcessableEvent) -> Result<()> {
        self.event_sender
            .send(event)
            .await
            .map_err(|e| BackchannelError::Configuration(format!("event queue closed: {}", e)))
    }

    /// Deletes all application data: database rows, in-memory state and log
    /// files.
    pub async fn delete_all_data(&self) -> Result<()> {
        tracing::debug!(target: "backchannel::delete_all_data", "Deleting all data");

        self.database.delete_all_data().await?;

        // Remove logs
        if self.config.logs_dir.exists() {
            for entry in std::fs::read_dir(&self.config.logs_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_file() {
                    std::fs::remove_file(path)?;
                } else if path.is_dir() {
                    std::fs::remove_dir_all(path)?;
                }
            }
        }

        self.sync.shutdown().await?;
        self.shutdown_event_processing().await?;
        Ok(())
    }

    /// Start the event processing loop in a background task
    async fn start_event_processing_loop(
        &self,
        receiver: Receiver<ProcessableEvent>,
        shutdown_receiver: Receiver<()>,
    ) {
        let sync = self.sync.clone();
        tokio::spawn(async move {
            Self::process_events(sync, receiver, shutdown_receiver).await;
        });
    }

    /// Shutdown event processing gracefully
    pub(crate) async fn shutdown_event_processing(&self) -> Result<()> {
        match self.shutdown_sender.send(()).await {
            Ok(_) => Ok(()),
            Err(_) => Ok(()), // Expected if processor already shut down
        }
    }

    /// Main event processing loop
    async fn process_events(
        sync: Arc<SyncEngine>,
        mut receiver: Receiver<ProcessableEvent>,
        mut shutdown: Receiver<()>,
    ) {
        tracing::debug!(
            target: "backchannel::event_processing",
            "Starting event processing loop"
        );

        let mut shutting_down = false;

        loop {
            tokio::select! {
                Some(event) = receiver.recv() => {
                    sync.handle_event(event).await;
                }
                Some(_) = shutdown.recv(), if !shutting_down => {
                    tracing::info!(
                        target: "backchannel::event_processing",
                        "Received shutdown signal, finishing current queue..."
                    );
                    shutting_down = true;
                }
                else => {
                    if shutting_down {
                        tracing::debug!(
                            target: "backchannel::event_processing",
                            "Queue flushed, shutting down event processor"
                        );
                    } else {
                        tracing::debug!(
                            target: "backchannel::event_processing",
                            "All channels closed, exiting event processing loop"
                        );
                    }
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for Backchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backchannel")
            .field("config", &self.config)
            .field("database", &"<REDACTED>")
            .field("sync", &"<REDACTED>")
            .finish()
    }
}
