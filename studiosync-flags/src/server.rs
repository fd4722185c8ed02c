use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::database::get_pool;
use crate::evaluation_cache::EvaluationCacheManager;
use crate::flag_store::{PostgresFlagStore, SharedFlagStore};
use crate::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let pool = match get_pool(
        &config.database_url,
        config.max_pg_connections,
        Duration::from_secs(config.acquire_timeout_secs),
    )
    .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to create Postgres pool: {}", e);
            return;
        }
    };

    // Opt-in so that deploys with external schema management keep control.
    if *config.run_migrations {
        if let Err(e) = sqlx::migrate!().run(&pool).await {
            tracing::error!("Failed to run migrations: {}", e);
            return;
        }
        tracing::info!("migrations are up to date");
    }

    let store: SharedFlagStore = Arc::new(PostgresFlagStore::new(pool));

    let evaluation_cache = Arc::new(EvaluationCacheManager::new(
        store.clone(),
        Some(config.cache_max_subject_entries),
        Some(config.cache_ttl_seconds),
    ));

    let app = router::router(store, evaluation_cache, config);

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap()
}
