use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{delete, get, post},
};
use governor_backend::{
    AppState,
    config::Config,
    governance::governor::RequestGovernor,
    governance::upstream::EchoUpstream,
    middleware::log_errors,
    policy::PolicyStore,
    routes,
};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 限流状态的闲置回收周期
const PURGE_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env();

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    if config.rate_limit_fail_open {
        tracing::warn!("rate limiter configured to fail open on store errors");
    }

    // 设置应用状态
    let governor = Arc::new(RequestGovernor::new(config.rate_limit_fail_open));
    let state = AppState {
        config: config.clone(),
        policies: Arc::new(PolicyStore::new()),
        governor: governor.clone(),
        // 真实部署时由引擎适配层注入具体的 UpstreamCaller
        upstream: Arc::new(EchoUpstream::default()),
    };

    // 周期性回收闲置的限流状态
    let purge_governor = governor.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(PURGE_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            purge_governor.rate_limiter().purge_idle_at(chrono::Utc::now());
        }
    });

    // 单个机器人的治理路由
    let chatbot_routes = Router::new()
        .route("/chat", post(routes::chat::chat))
        .route(
            "/rate-limit",
            get(routes::policy::get_rate_limit).post(routes::policy::set_rate_limit),
        )
        .route(
            "/cache-config",
            get(routes::policy::get_cache_config)
                .post(routes::policy::set_cache_config)
                .delete(routes::policy::flush_cache),
        )
        .route(
            "/retry-config",
            get(routes::policy::get_retry_config).post(routes::policy::set_retry_config),
        )
        .route(
            "/cost-budget",
            get(routes::policy::get_cost_budget).post(routes::policy::set_cost_budget),
        )
        .route("/cost-stats", get(routes::cost::cost_stats))
        .route("/cost-forecast", get(routes::cost::cost_forecast))
        .route("/cost-export", get(routes::cost::cost_export))
        .route("/runtime", delete(routes::policy::purge_runtime));

    let router = Router::new().nest(
        &config.api_base_uri.clone(),
        Router::new()
            .route("/ping", get(routes::ping))
            .nest("/chatbots/{chatbot_id}", chatbot_routes),
    );

    // 添加日志中间件
    let router = router.layer(axum::middleware::from_fn(log_errors));

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        let cors = CorsLayer::permissive();
        router.layer(cors)
    };

    let app = router.with_state(state.clone());

    // 启动服务器
    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
