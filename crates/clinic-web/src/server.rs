//! Web服务器

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{delete, get, post, put},
    Router,
};
use clinic_core::ClinicStore;
use clinic_workflow::{QueueManager, Registry, SlotAllocator};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::auth::{auth_middleware, login_handler, AccessGate};
use crate::handlers::*;

/// 请求处理器共享的服务
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<QueueManager>,
    pub slots: Arc<SlotAllocator>,
    pub registry: Arc<Registry>,
    pub gate: Arc<AccessGate>,
}

impl AppState {
    /// 在同一个存储上组装全部服务
    pub fn new(store: Arc<dyn ClinicStore>, gate: AccessGate, booking_window_days: i64) -> Self {
        Self {
            queue: Arc::new(QueueManager::new(store.clone())),
            slots: Arc::new(SlotAllocator::new(store.clone(), booking_window_days)),
            registry: Arc::new(Registry::new(store)),
            gate: Arc::new(gate),
        }
    }
}

pub struct WebServer {
    addr: SocketAddr,
    app: Router,
}

impl WebServer {
    /// `cors_origins` 为空时允许任意来源
    pub fn new(addr: SocketAddr, state: AppState, cors_origins: &[String]) -> Self {
        let app = create_app(state).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origins)),
        );

        Self { addr, app }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("Starting web server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start web server: {}", e))?;

        Ok(())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

/// 全部路由，不含全局中间件
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes(state.clone()))
        .with_state(state)
}

fn api_routes(state: AppState) -> Router<AppState> {
    // 需要令牌的路由
    let protected = Router::new()
        .route("/queue/join", post(join_queue))
        .route("/slots/book", post(book_slot))
        .route("/slots/release", post(release_slot))
        .route_layer(middleware::from_fn_with_state(state.gate.clone(), auth_middleware));

    Router::new()
        .route("/patients/auth", post(login_handler))
        .route("/patients/checkin", post(check_in))
        .route("/patients/doctors", get(list_doctors))
        .route("/queue/status/:doctor_id", get(queue_status))
        .route("/queue/next/:doctor_id", get(next_patient))
        .route("/slots/available/:doctor_id", get(available_slots))
        .route("/slots/delete/slot/:slot_id", delete(delete_slot))
        .route("/doctors/availability/:doctor_id", put(set_doctor_availability))
        .nest("/dev", dev_routes())
        .merge(protected)
}

/// 名册和号源管理路由
fn dev_routes() -> Router<AppState> {
    Router::new()
        .route("/get/users", get(dev_list_users))
        .route("/add/user", post(dev_add_user))
        .route("/get/doctors", get(dev_list_doctors))
        .route("/add/doctor", post(dev_add_doctor))
        .route("/get/slots", get(dev_list_slots))
        .route("/post/slot", post(dev_create_slot))
        .route("/delete/doctor/:doctor_id", delete(dev_delete_doctor))
}
