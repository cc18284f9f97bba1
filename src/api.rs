use crate::core::InferenceEngine;
use crate::server::server::{chat_completion, completions, health, list_models, root};
use crate::server::ServerData;
use crate::utils::config::ServerConfig;
use axum::routing::{get, post};
use axum::Router;
use std::future::IntoFuture;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Build the HTTP application around an engine.
pub fn router(config: ServerConfig, engine: Arc<dyn InferenceEngine>) -> Router {
    let server_data = ServerData { engine, config };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completion))
        .route("/v1/completions", post(completions))
        .layer(cors)
        .with_state(Arc::new(server_data))
}

/// Serve until the listener fails or CTRL+C is received.
pub async fn start_server(config: ServerConfig, engine: Arc<dyn InferenceEngine>) -> anyhow::Result<()> {
    let addr = config.bind_addr();
    tracing::info!(
        "Serving '{}' (upstream {}) on http://{}/v1/",
        engine.model_name(),
        config.upstream_url,
        addr
    );
    if !engine.ready().await {
        tracing::warn!("Upstream engine is not reachable yet, /health will report 503");
    }

    let app = router(config, engine);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            if let Err(e) = result {
                tracing::error!("Chat API server error: {e:?}");
                return Err(e.into());
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received CTRL+C, shutting down server...");
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        FragmentStream, GenerationFragment, GenerationRequest, Result as EngineResult,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use tower::ServiceExt;

    struct IdleEngine;

    impl InferenceEngine for IdleEngine {
        fn model_name(&self) -> &str {
            "idle"
        }

        fn ready(&self) -> BoxFuture<'_, bool> {
            async { true }.boxed()
        }

        fn generate(&self, _: GenerationRequest) -> BoxFuture<'_, EngineResult<GenerationFragment>> {
            async { Ok(GenerationFragment::new("id", "idle", "hello", 0)) }.boxed()
        }

        fn generate_stream(&self, _: GenerationRequest) -> BoxFuture<'_, EngineResult<FragmentStream>> {
            async { Ok(futures::StreamExt::boxed(futures::stream::empty())) }.boxed()
        }
    }

    async fn status_of(request: Request<Body>) -> StatusCode {
        router(ServerConfig::default(), Arc::new(IdleEngine))
            .oneshot(request)
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn routes_are_mounted() {
        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        assert_eq!(status_of(get("/")).await, StatusCode::OK);
        assert_eq!(status_of(get("/health")).await, StatusCode::OK);
        assert_eq!(status_of(get("/v1/models")).await, StatusCode::OK);
        assert_eq!(status_of(get("/missing")).await, StatusCode::NOT_FOUND);

        let completions = Request::post("/v1/completions")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        assert_eq!(status_of(completions).await, StatusCode::BAD_REQUEST);

        let chat = Request::post("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .unwrap();
        assert_eq!(status_of(chat).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_preflight_is_allowed() {
        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/v1/chat/completions")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = router(ServerConfig::default(), Arc::new(IdleEngine))
            .oneshot(preflight)
            .await
            .unwrap();
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }
}
