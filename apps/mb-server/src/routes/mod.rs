pub mod files;
pub mod records;
pub mod response;
pub mod status;
pub mod tasks;
pub mod uploads;
pub mod users;

use axum::http::Method;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE]);

    Router::new()
        .merge(status::router())
        .merge(tasks::router())
        .merge(records::router())
        .merge(uploads::router())
        .merge(files::router())
        .merge(users::router())
        .merge(crate::openapi::router())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod auth_gaps_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::{delete, get, post};
    use std::sync::OnceLock;
    use tower::ServiceExt;

    static STATE: OnceLock<AppState> = OnceLock::new();

    fn state() -> AppState {
        STATE.get_or_init(crate::test_support::test_state).clone()
    }

    #[tokio::test]
    async fn upload_requires_bearer_auth() {
        for uri in ["/jp/upload", "/nz/upload"] {
            let app = Router::new()
                .route("/jp/upload", post(uploads::upload_jp_archive))
                .route("/nz/upload", post(uploads::upload_nz_archive))
                .with_state(state());
            let resp = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri(uri)
                        .header("content-type", "multipart/form-data; boundary=x")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn whoami_requires_bearer_auth() {
        let app = Router::new()
            .route("/user/whoami", get(users::retrieve_myself))
            .with_state(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/user/whoami")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn file_delete_requires_bearer_auth() {
        let app = Router::new()
            .route("/access/{*file_path}", delete(files::delete_file))
            .with_state(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/access/abc/x.tar.gz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn index_requires_bearer_auth() {
        let app = Router::new()
            .route("/index", post(records::index_records))
            .with_state(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/index")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"records\":[]}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn root_redirects_to_docs() {
        let app = Router::new()
            .route("/", get(status::redirect_to_docs))
            .with_state(state());
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(resp.headers()["location"], "/docs");
    }

    #[tokio::test]
    async fn alive_answers_without_backends() {
        let app = Router::new()
            .route("/alive", get(status::alive))
            .with_state(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/alive")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
