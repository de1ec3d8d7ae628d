//! HTTP routes of the internal callback server

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Router};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::futures::FutureStore;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/:provider/oauth2/callback", get(oauth2_callback))
        .route("/auth/token", get(token_form))
        .route(
            "/auth/token/callback",
            get(token_callback).post(token_callback),
        )
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct OAuth2CallbackParams {
    state: String,
    code: String,
}

/// OAuth provider redirect target; the `state` parameter is the future UID
async fn oauth2_callback(
    Path(provider): Path<String>,
    Query(params): Query<OAuth2CallbackParams>,
) -> impl IntoResponse {
    debug!(%provider, state = %params.state, "oauth2 callback received");
    match FutureStore::global().resolve(&params.state, params.code) {
        Ok(()) => (
            StatusCode::OK,
            Html(DONE_PAGE.to_string()),
        ),
        Err(e) => {
            warn!(%provider, state = %params.state, error = %e, "callback for unknown or finished flow");
            (
                StatusCode::NOT_FOUND,
                Html(format!("<html><body>Unknown authentication flow: {}</body></html>", params.state)),
            )
        }
    }
}

#[derive(Deserialize)]
struct TokenFormParams {
    state: String,
}

/// Form where the user pastes a static token. The action is relative so it
/// resolves under the proxy prefix as well as directly.
async fn token_form(Query(params): Query<TokenFormParams>) -> Html<String> {
    Html(format!(
        r#"<html><body>
<form action="token/callback" method="get">
  <input type="hidden" name="state" value="{state}" />
  <label>Access token: <input type="password" name="token" autofocus /></label>
  <button type="submit">Save</button>
</form>
</body></html>"#,
        state = params.state
    ))
}

#[derive(Deserialize)]
struct TokenCallbackParams {
    state: String,
    token: String,
}

/// Token submission target. Accepts GET with query parameters and POST with
/// either query parameters or an urlencoded form body.
async fn token_callback(
    query: Option<Query<TokenCallbackParams>>,
    form: Option<Form<TokenCallbackParams>>,
) -> Response {
    let Some(params) = query.map(|Query(p)| p).or_else(|| form.map(|Form(p)| p)) else {
        return (
            StatusCode::BAD_REQUEST,
            Html("<html><body>Missing state or token</body></html>".to_string()),
        )
            .into_response();
    };
    match FutureStore::global().resolve(&params.state, params.token) {
        Ok(()) => (StatusCode::OK, Html(DONE_PAGE.to_string())).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Html(format!(
                "<html><body>Unknown authentication flow: {}</body></html>",
                params.state
            )),
        )
            .into_response(),
    }
}

const DONE_PAGE: &str =
    "<html><body>Authentication complete. You can close this window.</body></html>";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::futures::FutureMetadata;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        router()
    }

    #[tokio::test]
    async fn health_responds() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn oauth2_callback_resolves_future() {
        FutureStore::global().create("route-oauth-uid", FutureMetadata::default());
        let response = app()
            .oneshot(
                Request::get("/auth/github/oauth2/callback?state=route-oauth-uid&code=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(FutureStore::global().is_done("route-oauth-uid"), Some(true));
        FutureStore::global().delete("route-oauth-uid");
    }

    #[tokio::test]
    async fn unknown_state_is_not_found() {
        let response = app()
            .oneshot(
                Request::get("/auth/github/oauth2/callback?state=never-created&code=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn token_callback_resolves_future() {
        FutureStore::global().create("route-token-uid", FutureMetadata::default());
        let response = app()
            .oneshot(
                Request::get("/auth/token/callback?state=route-token-uid&token=sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(FutureStore::global().is_done("route-token-uid"), Some(true));
        FutureStore::global().delete("route-token-uid");
    }

    #[tokio::test]
    async fn token_callback_accepts_post_form() {
        FutureStore::global().create("route-token-post", FutureMetadata::default());
        let response = app()
            .oneshot(
                Request::post("/auth/token/callback")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(Body::from("state=route-token-post&token=sekrit"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            FutureStore::global().is_done("route-token-post"),
            Some(true)
        );
        FutureStore::global().delete("route-token-post");
    }

    #[tokio::test]
    async fn token_callback_accepts_post_query() {
        FutureStore::global().create("route-token-postq", FutureMetadata::default());
        let response = app()
            .oneshot(
                Request::post("/auth/token/callback?state=route-token-postq&token=sekrit")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            FutureStore::global().is_done("route-token-postq"),
            Some(true)
        );
        FutureStore::global().delete("route-token-postq");
    }
}
