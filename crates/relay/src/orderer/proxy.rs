use std::sync::Arc;

use concord_common::protocol::messages::Client;
use tracing::debug;

use super::{Orderer, OrdererConnection, OrdererFuture};
use crate::{rooms::SocketHandle, store::DocumentDetails};

/// Opens ordering connections on a service outside this process.
pub trait OrdererConnectionFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        socket: &'a SocketHandle,
        client_id: &'a str,
        client: &'a Client,
        details: &'a DocumentDetails,
    ) -> OrdererFuture<'a, Arc<dyn OrdererConnection>>;
}

/// Orderer that delegates every connection to a factory. It owns no
/// per-document state, so a single instance serves all documents.
pub struct ProxyOrderer {
    factory: Arc<dyn OrdererConnectionFactory>,
}

impl ProxyOrderer {
    pub fn new(factory: Arc<dyn OrdererConnectionFactory>) -> Self {
        Self { factory }
    }
}

impl Orderer for ProxyOrderer {
    fn connect<'a>(
        &'a self,
        socket: &'a SocketHandle,
        client_id: &'a str,
        client: &'a Client,
        details: &'a DocumentDetails,
    ) -> OrdererFuture<'a, Arc<dyn OrdererConnection>> {
        debug!(
            tenant_id = %details.value.tenant_id,
            document_id = %details.value.document_id,
            client_id,
            "delegating orderer connection"
        );
        self.factory.connect(socket, client_id, client, details)
    }

    fn close(&self) -> OrdererFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use concord_common::protocol::messages::{Client, DocumentMessage, ServiceConfiguration};
    use tokio::sync::watch;

    use super::OrdererConnectionFactory;
    use crate::{
        orderer::{ConnectionState, Lifecycle, OrdererConnection, OrdererError, OrdererFuture},
        rooms::SocketHandle,
        store::DocumentDetails,
    };

    /// Connection that records ordered messages instead of sequencing them.
    pub struct RecordingConnection {
        pub tenant_id: String,
        pub document_id: String,
        pub client_id: String,
        pub lifecycle: Lifecycle,
        pub ordered: Mutex<Vec<DocumentMessage>>,
        pub service_configuration: ServiceConfiguration,
    }

    impl OrdererConnection for RecordingConnection {
        fn tenant_id(&self) -> &str {
            &self.tenant_id
        }

        fn document_id(&self) -> &str {
            &self.document_id
        }

        fn client_id(&self) -> &str {
            &self.client_id
        }

        fn parent_branch(&self) -> Option<&str> {
            None
        }

        fn max_message_size(&self) -> u64 {
            self.service_configuration.max_message_size
        }

        fn service_configuration(&self) -> &ServiceConfiguration {
            &self.service_configuration
        }

        fn connect(&self) -> OrdererFuture<'_, ()> {
            Box::pin(async move { self.lifecycle.transition(ConnectionState::Connected) })
        }

        fn order(&self, messages: Vec<DocumentMessage>) {
            self.ordered.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).extend(messages);
        }

        fn disconnect(&self) -> OrdererFuture<'_, ()> {
            Box::pin(async move {
                let _ = self.lifecycle.transition(ConnectionState::Closed);
                Ok(())
            })
        }

        fn state(&self) -> watch::Receiver<ConnectionState> {
            self.lifecycle.subscribe()
        }
    }

    /// Factory handing out `RecordingConnection`s; can be told to refuse.
    #[derive(Default)]
    pub struct RecordingFactory {
        pub refuse: bool,
        pub connections: Mutex<Vec<Arc<RecordingConnection>>>,
    }

    impl OrdererConnectionFactory for RecordingFactory {
        fn connect<'a>(
            &'a self,
            _socket: &'a SocketHandle,
            client_id: &'a str,
            _client: &'a Client,
            details: &'a DocumentDetails,
        ) -> OrdererFuture<'a, Arc<dyn OrdererConnection>> {
            Box::pin(async move {
                if self.refuse {
                    return Err(OrdererError::Remote("connection refused".to_string()));
                }
                let connection = Arc::new(RecordingConnection {
                    tenant_id: details.value.tenant_id.clone(),
                    document_id: details.value.document_id.clone(),
                    client_id: client_id.to_string(),
                    lifecycle: Lifecycle::new(),
                    ordered: Mutex::new(Vec::new()),
                    service_configuration: ServiceConfiguration::default(),
                });
                self.connections
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(Arc::clone(&connection));
                let connection: Arc<dyn OrdererConnection> = connection;
                Ok(connection)
            })
        }
    }
}
