use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use concord_common::{protocol::messages::ServiceConfiguration, tree::ProtocolState};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use super::{
    local::DocumentKey, remote::RemoteOrdererConnectionFactory, LocalOrderer, Orderer,
    OrdererConnectionFactory, OrdererError, ProxyOrderer,
};
use crate::{
    config::{OrdererKind, RelayConfig},
    rooms::RoomHub,
};

#[derive(Default)]
struct Sequencers {
    running: HashMap<DocumentKey, Arc<LocalOrderer>>,
    /// Final state of reclaimed sequencers, picked up when the document is
    /// opened again.
    checkpoints: HashMap<DocumentKey, ProtocolState>,
}

enum Strategy {
    Local { sequencers: Arc<RwLock<Sequencers>>, idle: mpsc::UnboundedSender<DocumentKey> },
    Proxy(Arc<ProxyOrderer>),
}

/// Resolves the orderer responsible for a document.
pub struct OrdererManager {
    strategy: Strategy,
    rooms: Arc<RoomHub>,
    service_configuration: ServiceConfiguration,
}

impl OrdererManager {
    /// Local sequencers are started on first use and reclaimed once their
    /// last client leaves. Must be called inside a tokio runtime.
    pub fn local(rooms: Arc<RoomHub>, service_configuration: ServiceConfiguration) -> Self {
        let sequencers = Arc::new(RwLock::new(Sequencers::default()));
        let (idle, idle_reports) = mpsc::unbounded_channel();
        tokio::spawn(reclaim_idle_sequencers(Arc::downgrade(&sequencers), idle_reports));

        Self { strategy: Strategy::Local { sequencers, idle }, rooms, service_configuration }
    }

    pub fn proxy(
        rooms: Arc<RoomHub>,
        factory: Arc<dyn OrdererConnectionFactory>,
        service_configuration: ServiceConfiguration,
    ) -> Self {
        Self {
            strategy: Strategy::Proxy(Arc::new(ProxyOrderer::new(factory))),
            rooms,
            service_configuration,
        }
    }

    pub fn from_config(config: &RelayConfig, rooms: Arc<RoomHub>) -> anyhow::Result<Self> {
        let service_configuration = config.service_configuration.clone();
        match config.orderer {
            OrdererKind::Local => Ok(Self::local(rooms, service_configuration)),
            OrdererKind::Proxy => {
                let Some(url) = config.orderer_url.as_deref() else {
                    anyhow::bail!("CONCORD_RELAY_ORDERER_URL is required when CONCORD_RELAY_ORDERER=proxy");
                };
                let factory = RemoteOrdererConnectionFactory::new(
                    url,
                    Arc::clone(&rooms),
                    service_configuration.clone(),
                )?;
                Ok(Self::proxy(rooms, Arc::new(factory), service_configuration))
            }
        }
    }

    /// Returns the document's orderer, starting a local sequencer on first use.
    pub async fn get_orderer(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Arc<dyn Orderer>, OrdererError> {
        match &self.strategy {
            Strategy::Proxy(orderer) => Ok(Arc::clone(orderer) as Arc<dyn Orderer>),
            Strategy::Local { sequencers, idle } => {
                let key = (tenant_id.to_string(), document_id.to_string());
                if let Some(orderer) = sequencers.read().await.running.get(&key) {
                    if orderer.is_running() {
                        return Ok(Arc::clone(orderer) as Arc<dyn Orderer>);
                    }
                }

                let mut sequencers = sequencers.write().await;
                if let Some(orderer) = sequencers.running.get(&key).filter(|orderer| orderer.is_running()) {
                    return Ok(Arc::clone(orderer) as Arc<dyn Orderer>);
                }

                let checkpoint = sequencers.checkpoints.remove(&key);
                info!(tenant_id, document_id, resumed = checkpoint.is_some(), "starting local sequencer");
                let orderer = Arc::new(LocalOrderer::resume(
                    tenant_id,
                    document_id,
                    Arc::clone(&self.rooms),
                    self.service_configuration.clone(),
                    checkpoint,
                    idle.clone(),
                ));
                sequencers.running.insert(key, Arc::clone(&orderer));
                Ok(orderer as Arc<dyn Orderer>)
            }
        }
    }

    /// The running local sequencer of a document, if any.
    pub async fn local_orderer(&self, tenant_id: &str, document_id: &str) -> Option<Arc<LocalOrderer>> {
        match &self.strategy {
            Strategy::Local { sequencers, .. } => sequencers
                .read()
                .await
                .running
                .get(&(tenant_id.to_string(), document_id.to_string()))
                .cloned(),
            Strategy::Proxy(_) => None,
        }
    }

    /// Number of local sequencers currently running.
    pub async fn running_sequencers(&self) -> usize {
        match &self.strategy {
            Strategy::Local { sequencers, .. } => sequencers.read().await.running.len(),
            Strategy::Proxy(_) => 0,
        }
    }

    /// Stops every orderer this manager started.
    pub async fn close(&self) -> Result<(), OrdererError> {
        match &self.strategy {
            Strategy::Proxy(orderer) => orderer.close().await,
            Strategy::Local { sequencers, .. } => {
                let drained: Vec<_> =
                    sequencers.write().await.running.drain().map(|(_, orderer)| orderer).collect();
                for orderer in drained {
                    orderer.close().await?;
                }
                Ok(())
            }
        }
    }
}

/// Stops sequencers whose last client left. A sequencer is only retired
/// while the write lock is held and nobody else holds its orderer, so a
/// connect in flight between `get_orderer` and its join keeps it alive.
async fn reclaim_idle_sequencers(
    sequencers: Weak<RwLock<Sequencers>>,
    mut idle_reports: mpsc::UnboundedReceiver<DocumentKey>,
) {
    while let Some(key) = idle_reports.recv().await {
        let Some(sequencers) = sequencers.upgrade() else {
            break;
        };
        let mut sequencers = sequencers.write().await;
        let Some(orderer) = sequencers.running.get(&key) else {
            continue;
        };
        if Arc::strong_count(orderer) > 1 {
            continue;
        }

        let retired = orderer.retire().await;
        match retired {
            Ok(Some(checkpoint)) => {
                sequencers.running.remove(&key);
                info!(
                    tenant_id = %key.0,
                    document_id = %key.1,
                    sequence_number = checkpoint.attributes.sequence_number,
                    "reclaimed idle sequencer"
                );
                sequencers.checkpoints.insert(key, checkpoint);
            }
            Ok(None) => {}
            Err(retire_error) => {
                warn!(error = %retire_error, "dropping stopped sequencer");
                sequencers.running.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use concord_common::protocol::messages::{Client, ServiceConfiguration};
    use tokio::{sync::mpsc, time::timeout};

    use super::OrdererManager;
    use crate::{
        config::{OrdererKind, RelayConfig},
        orderer::{proxy::test_support::RecordingFactory, OrdererConnection},
        rooms::{RoomHub, SocketHandle},
        store::{DocumentDetails, DocumentRecord},
    };

    async fn join(manager: &OrdererManager, document_id: &str, client_id: &str) -> Arc<dyn OrdererConnection> {
        let (sender, _events) = mpsc::unbounded_channel();
        let details = DocumentDetails {
            existing: false,
            value: DocumentRecord {
                tenant_id: "t".to_string(),
                document_id: document_id.to_string(),
                created_at: Utc::now(),
            },
        };
        let orderer = manager.get_orderer("t", document_id).await.expect("orderer should start");
        let connection = orderer
            .connect(&SocketHandle::new(sender), client_id, &Client::default(), &details)
            .await
            .expect("connection should bind");
        connection.connect().await.expect("join should be sequenced");
        connection
    }

    async fn wait_for_running(manager: &OrdererManager, expected: usize) {
        timeout(Duration::from_secs(2), async {
            while manager.running_sequencers().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("running sequencer count should settle");
    }

    #[tokio::test]
    async fn local_orderers_are_cached_per_document() {
        let manager = OrdererManager::local(Arc::new(RoomHub::new()), ServiceConfiguration::default());

        let first = manager.get_orderer("t", "doc").await.expect("orderer should start");
        let again = manager.get_orderer("t", "doc").await.expect("orderer should be cached");
        let other = manager.get_orderer("t", "other").await.expect("orderer should start");

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert!(manager.local_orderer("t", "doc").await.is_some());
        assert!(manager.local_orderer("t", "missing").await.is_none());

        manager.close().await.expect("close should succeed");
        assert!(manager.local_orderer("t", "doc").await.is_none());
    }

    #[tokio::test]
    async fn documents_are_keyed_by_tenant_and_id_pairs() {
        let manager = OrdererManager::local(Arc::new(RoomHub::new()), ServiceConfiguration::default());

        let nested_tenant = manager.get_orderer("a/b", "c").await.expect("orderer should start");
        let nested_document = manager.get_orderer("a", "b/c").await.expect("orderer should start");

        assert!(!Arc::ptr_eq(&nested_tenant, &nested_document));
        assert_eq!(manager.running_sequencers().await, 2);
    }

    #[tokio::test]
    async fn sequencers_are_reclaimed_after_the_last_client_leaves() {
        let manager = OrdererManager::local(Arc::new(RoomHub::new()), ServiceConfiguration::default());

        for document_id in ["doc-1", "doc-2", "doc-3"] {
            let connection = join(&manager, document_id, "client-1").await;
            connection.disconnect().await.expect("disconnect should succeed");
        }
        wait_for_running(&manager, 0).await;
        assert!(manager.local_orderer("t", "doc-1").await.is_none());

        let connection = join(&manager, "doc-1", "client-2").await;
        let orderer = manager.local_orderer("t", "doc-1").await.expect("doc-1 should restart");
        let summary = orderer.summarize().await.expect("summary should succeed");
        assert_eq!(summary.attributes.sequence_number, 3);
        drop(orderer);

        connection.disconnect().await.expect("disconnect should succeed");
        wait_for_running(&manager, 0).await;
    }

    #[tokio::test]
    async fn sequencers_with_joined_clients_stay_running() {
        let manager = OrdererManager::local(Arc::new(RoomHub::new()), ServiceConfiguration::default());

        let stays = join(&manager, "doc-1", "client-1").await;
        let leaves = join(&manager, "doc-1", "client-2").await;
        leaves.disconnect().await.expect("disconnect should succeed");
        let other = join(&manager, "doc-2", "client-1").await;
        other.disconnect().await.expect("disconnect should succeed");

        wait_for_running(&manager, 1).await;
        assert!(manager.local_orderer("t", "doc-1").await.is_some());
        drop(stays);
    }

    #[tokio::test]
    async fn proxy_mode_shares_one_orderer() {
        let manager = OrdererManager::proxy(
            Arc::new(RoomHub::new()),
            Arc::new(RecordingFactory::default()),
            ServiceConfiguration::default(),
        );

        let first = manager.get_orderer("t", "a").await.expect("proxy should resolve");
        let second = manager.get_orderer("t", "b").await.expect("proxy should resolve");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.local_orderer("t", "a").await.is_none());
    }

    #[test]
    fn proxy_mode_requires_an_orderer_url() {
        let config = RelayConfig { orderer: OrdererKind::Proxy, orderer_url: None, ..RelayConfig::default() };

        let error = match OrdererManager::from_config(&config, Arc::new(RoomHub::new())) {
            Ok(_) => panic!("proxy without url should fail"),
            Err(error) => error,
        };

        assert!(error.to_string().contains("CONCORD_RELAY_ORDERER_URL"));
    }
}
