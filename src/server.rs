//! Server singleton wiring configuration, storage, services and the
//! replica actor together, plus the metrics scrape endpoint.

use std::path::Path;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;

use crate::config;
use crate::metrics;
use crate::raft::entry::Configuration;
use crate::raft::log::{MemLog, RaftLog, SegmentedLog};
use crate::raft::meta::MetaStore;
use crate::raft::replica::{Replica, ReplicaContext, ReplicaHandle};
use crate::raft::StorageLevel;
use crate::service::lock::{LockService, LOCK_SERVICE};
use crate::service::session::ServiceEvent;
use crate::service::ServiceRuntime;

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();
pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get_or_init(|| Mutex::new(Server::builder()))
}

pub struct Server {
    handle: ReplicaHandle,
}

impl Server {
    fn builder() -> Self {
        let config = config::instance().lock().unwrap().clone();

        let mut runtime = ServiceRuntime::new();
        runtime.register(LOCK_SERVICE, LockService::factory);
        let events = runtime.sessions_mut().subscribe();
        Self::start_event_drain(events);

        let meta = MetaStore::new(&config.base_path, &config.id, config.storage_level)
            .expect("failed to open metadata store");
        let log: Box<dyn RaftLog> = match config.storage_level {
            StorageLevel::Memory => Box::new(MemLog::new()),
            StorageLevel::Disk => Box::new(
                SegmentedLog::open(Path::new(&config.base_path).join("log"))
                    .expect("failed to open log storage"),
            ),
        };
        let cluster = Configuration::new(config.member_ids());
        let ctx = ReplicaContext::new(
            config.id.clone(),
            cluster,
            meta,
            log,
            Box::new(runtime),
            config.max_log_size,
        )
        .expect("failed to open replica");

        let handle = Replica::start(ctx);
        Server { handle }
    }

    pub async fn start(&mut self) {
        self.start_metrics_server().await;
    }

    pub async fn stop(&mut self) {
        self.handle.close().await;
        log::info!("server stop");
    }

    /// Handle used by the transport layer to reach the replica.
    pub fn replica(&self) -> ReplicaHandle {
        self.handle.clone()
    }

    // Service events ride a side channel to client sessions; the session
    // transport picks them up here.
    fn start_event_drain(mut events: UnboundedReceiver<ServiceEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log::debug!(
                    "event for session {} from service {}: {} bytes",
                    event.session,
                    event.service,
                    event.payload.len()
                );
            }
        });
    }

    async fn start_metrics_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .as_str()
            .parse()
            .unwrap();
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        encoder.encode(&metric_families, &mut buffer).unwrap();
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            tokio::pin!(server);
            server.await.unwrap()
        });
        log::info!("metrics server started on {}", addr);
    }
}
