//! Estado compartido del gateway.
//!
//! Todo se construye aquí una sola vez y se pasa a los handlers dentro de un
//! `Arc<AppState>`. No hay singletons de módulo: el colector de métricas es
//! uno por estado y los guards son uno por run o sesión.

use std::sync::Arc;

use gate_adapters::{AdapterRegistry, CommentPostConnector, CommentSink, HttpCompletionBackend, HttpEmbedder,
                    InMemoryCommentSink, InMemoryInvocationStore, InvocationStore, KnowledgeStore, NhaInvokeConnector,
                    RagQueryConnector, UpstreamConfig};
use gate_core::{EventStore, FlowCatalog, FlowEngine, InMemoryEventStore, InMemoryFlowCatalog, NodeKind,
                ReplayRunRepository};
use gate_ledger::{BillingManager, InMemoryLedgerStore, Ledger, LedgerStore};
use gate_metrics::MetricsCollector;
use gate_org::{AuditLog, OrgManager, PrivacyJobs};
use gate_persistence::{PgEventStore, PgFlowCatalog, PgInvocationStore, PgJobStream, PgLedgerStore, PgPool,
                       PoolProvider};
use gate_worker::{InMemoryStream, JobStream};
use log::info;

use crate::chat::ChatService;
use crate::config::{GatewayConfig, UpstreamSettings};
use crate::invocations::InvocationService;

/// Engine con el event store elegido en tiempo de arranque.
pub type Engine = FlowEngine<Arc<dyn EventStore>, ReplayRunRepository>;

/// Backends de persistencia intercambiables. Dos `AppState` construidos
/// sobre los mismos stores se comportan como réplicas del mismo gateway.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub stream: Arc<dyn JobStream>,
    pub catalog: Arc<dyn FlowCatalog>,
    pub invocations: Arc<dyn InvocationStore>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores")
         .field("stream", &self.stream)
         .field("catalog", &self.catalog)
         .field("invocations", &self.invocations)
         .finish_non_exhaustive()
    }
}

impl Stores {
    pub fn in_memory() -> Self {
        Self { events: Arc::new(InMemoryEventStore::new()),
               ledger: Arc::new(InMemoryLedgerStore::new()),
               stream: Arc::new(InMemoryStream::new()),
               catalog: Arc::new(InMemoryFlowCatalog::new()),
               invocations: Arc::new(InMemoryInvocationStore::new()) }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self { events: Arc::new(PgEventStore::new(PoolProvider::new(pool.clone()))),
               ledger: Arc::new(PgLedgerStore::new(PoolProvider::new(pool.clone()))),
               catalog: Arc::new(PgFlowCatalog::new(PoolProvider::new(pool.clone()))),
               invocations: Arc::new(PgInvocationStore::new(PoolProvider::new(pool.clone()))),
               stream: Arc::new(PgJobStream::new(pool)) }
    }
}

#[derive(Debug)]
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<Engine>,
    pub stream: Arc<dyn JobStream>,
    pub billing: Arc<BillingManager>,
    pub adapters: Arc<AdapterRegistry>,
    pub knowledge: Arc<KnowledgeStore>,
    pub comments: Arc<dyn CommentSink>,
    pub metrics: Arc<MetricsCollector>,
    pub audit: Arc<AuditLog>,
    pub orgs: Arc<OrgManager>,
    pub privacy: Arc<PrivacyJobs>,
    pub invocations: Arc<InvocationService>,
    pub chat: ChatService,
}

/// Agentes y conocimiento sobre los backends HTTP configurados; sin URL,
/// backend léxico y embedding por hash.
fn upstream_backends(settings: &UpstreamSettings) -> (Arc<AdapterRegistry>, Arc<KnowledgeStore>) {
    let upstream = |url: &str| UpstreamConfig::new(url, settings.timeout).with_token(settings.token.clone());
    let adapters = match &settings.completion_url {
        Some(url) => {
            info!("upstream:completion url={url}");
            AdapterRegistry::with_backend(Arc::new(HttpCompletionBackend::new(upstream(url))))
        }
        None => AdapterRegistry::lexicon(),
    };
    let knowledge = match &settings.embedding_url {
        Some(url) => {
            info!("upstream:embedding url={url}");
            KnowledgeStore::new(Arc::new(HttpEmbedder::new(upstream(url))))
        }
        None => KnowledgeStore::default(),
    };
    (Arc::new(adapters), Arc::new(knowledge))
}

impl AppState {
    pub fn new(config: GatewayConfig, stores: Stores) -> Self {
        let metrics = Arc::new(MetricsCollector::new(config.metrics));
        let billing = Arc::new(BillingManager::new(Ledger::new(stores.ledger), config.quota));
        let (adapters, knowledge) = upstream_backends(&config.upstream);
        let comments: Arc<dyn CommentSink> = Arc::new(InMemoryCommentSink::new());
        let audit = Arc::new(AuditLog::new());
        let orgs = Arc::new(OrgManager::default().with_audit(audit.clone()));
        let privacy = Arc::new(PrivacyJobs::default().with_audit(audit.clone()));

        let nha = NhaInvokeConnector::new(adapters.clone()).with_billing(billing.clone())
                                                           .with_metrics(metrics.clone());
        let engine = FlowEngine::builder(stores.events, ReplayRunRepository::new())
            .catalog(stores.catalog)
            .with_builtin_connectors(config.delay_cap)
            .connector(NodeKind::NhaInvoke, Arc::new(nha))
            .connector(NodeKind::RagQuery, Arc::new(RagQueryConnector::new(knowledge.clone())))
            .connector(NodeKind::CommentPost, Arc::new(CommentPostConnector::new(comments.clone())))
            .observer(metrics.clone())
            .guard_config(config.guard.clone())
            .build();

        let invocations = Arc::new(InvocationService::new(adapters.clone(),
                                                          billing.clone(),
                                                          comments.clone(),
                                                          metrics.clone(),
                                                          stores.stream.clone(),
                                                          stores.invocations));
        let chat = ChatService::new(config.guard.clone(), knowledge.clone(), adapters.clone(), metrics.clone())
            .with_session_ttl(config.chat_session_ttl);

        Self { config,
               engine: Arc::new(engine),
               stream: stores.stream,
               billing,
               adapters,
               knowledge,
               comments,
               metrics,
               audit,
               orgs,
               privacy,
               invocations,
               chat }
    }

    /// Estado completamente en memoria.
    pub fn in_memory(config: GatewayConfig) -> Self {
        Self::new(config, Stores::in_memory())
    }
}
