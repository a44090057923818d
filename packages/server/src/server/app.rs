//! Application setup and router wiring.

use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kernel::artifacts::{ArtifactStore, FsArtifactStore};
use crate::kernel::kv::Kv;
use crate::kernel::metrics::QueueMetrics;
use crate::kernel::notifier::Notifier;
use crate::kernel::queue::repo::TaskRepo;
use crate::kernel::queue::results::ResultRepo;
use crate::kernel::queue::scripts::ScriptSet;
use crate::kernel::result_callback::ResultCallback;
use crate::kernel::results_service::ResultsService;
use crate::kernel::scheduler::SchedulerService;
use crate::kernel::subscriptions::SubscriptionRepo;
use crate::server::middleware::{require_auth, WorkerAuth};
use crate::server::routes;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Kv,
    pub repo: Arc<TaskRepo>,
    pub scheduler: Arc<SchedulerService>,
    pub results: Arc<ResultsService>,
    pub subscriptions: Arc<SubscriptionRepo>,
    pub auth: Arc<WorkerAuth>,
    pub metrics: Arc<QueueMetrics>,
}

impl AppState {
    /// Wire the kernel services over one KV connection.
    pub fn build(kv: Kv, config: Arc<Config>) -> anyhow::Result<Self> {
        let metrics = Arc::new(QueueMetrics::new()?);
        let scripts = Arc::new(ScriptSet::new());

        let repo = Arc::new(TaskRepo::new(
            kv.clone(),
            Arc::clone(&scripts),
            &config,
            Arc::clone(&metrics),
        ));
        let result_repo = Arc::new(ResultRepo::new(kv.clone(), scripts));
        let subscriptions = Arc::new(SubscriptionRepo::new(kv.clone()));

        let notifier = Arc::new(Notifier::new(
            Arc::clone(&subscriptions),
            kv.clone(),
            &config,
            Arc::clone(&metrics),
        ));
        let callback = Arc::new(ResultCallback::new(&config, Arc::clone(&metrics)));
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(
            config.artifact_dir.clone(),
            config.artifact_base_url.clone(),
        ));

        let scheduler = Arc::new(SchedulerService::new(
            Arc::clone(&repo),
            notifier,
            Arc::clone(&config),
        ));
        let results = Arc::new(ResultsService::new(
            Arc::clone(&repo),
            result_repo,
            artifacts,
            callback,
            Arc::clone(&metrics),
        ));
        let auth = Arc::new(WorkerAuth::from_config(&config)?);

        Ok(Self {
            config,
            kv,
            repo,
            scheduler,
            results,
            subscriptions,
            auth,
            metrics,
        })
    }
}

/// Build the axum router: the authenticated API under `/v1/codeq`, plus
/// unauthenticated health and metrics.
pub fn build_app(state: AppState) -> Router {
    let api = Router::new()
        .route("/tasks", post(routes::tasks::create_task))
        .route("/tasks/claim", post(routes::tasks::claim_task))
        .route("/tasks/:id", get(routes::tasks::get_task))
        .route("/tasks/:id/heartbeat", post(routes::tasks::heartbeat_task))
        .route("/tasks/:id/nack", post(routes::tasks::nack_task))
        .route("/tasks/:id/abandon", post(routes::tasks::abandon_task))
        .route(
            "/tasks/:id/result",
            post(routes::tasks::submit_result).get(routes::tasks::get_result),
        )
        .route(
            "/workers/subscriptions",
            post(routes::subscriptions::create_subscription),
        )
        .route(
            "/workers/subscriptions/:id/heartbeat",
            post(routes::subscriptions::heartbeat_subscription),
        )
        .route("/admin/queues", get(routes::admin::list_queues))
        .route("/admin/queues/:command", get(routes::admin::queue_stats))
        .route("/admin/tasks/cleanup", post(routes::admin::cleanup_tasks))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health::health_handler))
        .route("/metrics", get(routes::metrics::metrics_handler))
        .nest("/v1/codeq", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(60)))
        .with_state(state)
}
