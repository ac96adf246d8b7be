use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::audit::recorder::AuditRecorder;
use crate::config::Config;
use crate::flags::memory_store::MemoryFlagStore;
use crate::flags::pg_store::PgFlagStore;
use crate::router;
use crate::service::FlagService;
use crate::sse::broadcaster::ChangeBroadcaster;
use crate::sse::registry::ConnectionRegistry;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let broadcaster = ChangeBroadcaster::new(
        Arc::new(ConnectionRegistry::new()),
        config.broadcast_send_timeout(),
    );

    let (service, pg_store) = if *config.in_memory_store {
        tracing::warn!("Serving from the in-memory store, nothing will survive a restart");
        let store = Arc::new(MemoryFlagStore::new());
        let service = FlagService::new(store.clone(), AuditRecorder::new(store), broadcaster);
        (service, None)
    } else {
        let store = match PgFlagStore::new(
            &config.database_url,
            config.max_pg_connections,
            config.acquire_timeout(),
        )
        .await
        {
            Ok(store) => store,
            Err(e) => {
                tracing::error!("Failed to connect to postgres: {}", e);
                return;
            }
        };
        if let Err(e) = store.run_migrations().await {
            tracing::error!("Failed to run migrations: {}", e);
            return;
        }

        let shared = Arc::new(store.clone());
        let service = FlagService::new(shared.clone(), AuditRecorder::new(shared), broadcaster);
        (service, Some(store))
    };

    let app = router::router(service, pg_store, config);

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on unknown address: {}", e),
    }
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}
