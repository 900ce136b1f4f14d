//! 路由装配：每条受保护路由按「限流 → 会话 → 处理器」组合中间件。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::get;
use axum::{Router, middleware};
use std::sync::Arc;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::auth::{self, SessionGate};
use crate::config::Settings;
use crate::http::{self, client_key};
use crate::rate_limit::{self, Limit, RateLimiter, Rule, Throttle};
use crate::storage::ConsumeDir;
use crate::upload::{self, UploadConfig};
use crate::{health, pages};

/// Shared services and limits the router is built from.
pub struct AppParts {
    pub gate: Arc<SessionGate>,
    pub consume_dir: Arc<ConsumeDir>,
    pub upload: Arc<UploadConfig>,
    pub limiter: Arc<RateLimiter>,
    pub default_limits: Vec<Limit>,
    pub login_limit: Limit,
    pub upload_limit: Limit,
    pub trust_proxy: bool,
}

impl AppParts {
    pub fn from_settings(settings: &Settings, limiter: Arc<RateLimiter>) -> Self {
        Self {
            gate: Arc::new(SessionGate::new(
                settings.password_hash.clone(),
                &settings.secret_key,
                settings.session_ttl,
                settings.trust_proxy,
            )),
            consume_dir: Arc::new(ConsumeDir::new(settings.upload_folder.clone())),
            upload: Arc::new(UploadConfig {
                allowed: settings.allowed_extensions.clone(),
                max_request_size: settings.max_file_size,
            }),
            limiter,
            default_limits: settings.default_limits.clone(),
            login_limit: settings.login_limit,
            upload_limit: settings.upload_limit,
            trust_proxy: settings.trust_proxy,
        }
    }

    fn throttle(&self, name: &'static str, extra: Option<Limit>) -> Throttle {
        let mut limits = self.default_limits.clone();
        limits.extend(extra);
        Throttle::new(self.limiter.clone(), Rule::new(name, limits), self.trust_proxy)
    }
}

pub fn build_router(parts: AppParts) -> Router {
    let login_throttle = parts.throttle("login", Some(parts.login_limit));
    let logout_throttle = parts.throttle("logout", None);
    let upload_throttle = parts.throttle("upload", Some(parts.upload_limit));
    let trust_proxy = parts.trust_proxy;

    Router::new()
        .route(
            "/login",
            get(pages::login_page)
                .post(auth::login_submit)
                .route_layer(middleware::from_fn_with_state(
                    login_throttle,
                    rate_limit::throttle,
                )),
        )
        .route(
            "/logout",
            get(auth::logout).route_layer(middleware::from_fn_with_state(
                logout_throttle,
                rate_limit::throttle,
            )),
        )
        .route(
            "/",
            get(pages::upload_page)
                .post(upload::upload_files)
                .layer(DefaultBodyLimit::max(parts.upload.max_request_size))
                .route_layer(middleware::from_fn(auth::require_session))
                .route_layer(middleware::from_fn_with_state(
                    upload_throttle,
                    rate_limit::throttle,
                )),
        )
        .route("/health", get(health::health))
        .route("/static/{*path}", get(pages::serve_asset))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(move |request: &Request<_>| {
                    let client_ip = client_key(request, trust_proxy);
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(Extension(parts.gate))
        .layer(Extension(parts.consume_dir))
        .layer(Extension(parts.upload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{HeaderValue, StatusCode, header};
    use axum::response::Response;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    use crate::auth::tests::{TEST_SECRET, fast_hash};
    use crate::upload::AllowedExtensions;

    const PASSWORD: &str = "correct horse battery staple";
    const BOUNDARY: &str = "consume-drop-test-boundary";

    fn test_app(max_request_size: usize) -> (TempDir, Router) {
        let temp = tempdir().expect("tempdir");
        let parts = AppParts {
            gate: Arc::new(SessionGate::new(
                fast_hash(PASSWORD),
                TEST_SECRET,
                Duration::from_secs(3600),
                false,
            )),
            consume_dir: Arc::new(ConsumeDir::new(temp.path().join("consume"))),
            upload: Arc::new(UploadConfig {
                allowed: AllowedExtensions::parse("pdf,png,jpg,jpeg,gif,tiff,txt,doc,docx"),
                max_request_size,
            }),
            limiter: Arc::new(RateLimiter::new()),
            default_limits: vec![Limit::per_day(200), Limit::per_hour(50)],
            login_limit: Limit::per_minute(10),
            upload_limit: Limit::per_minute(20),
            trust_proxy: false,
        };
        (temp, build_router(parts))
    }

    /// Minimal client-side cookie store.
    #[derive(Default)]
    struct Cookies(BTreeMap<String, String>);

    impl Cookies {
        fn update(&mut self, response: &Response) {
            for value in response.headers().get_all(header::SET_COOKIE) {
                let value = value.to_str().expect("set-cookie");
                let pair = value.split(';').next().unwrap_or_default();
                let (name, cookie_value) = pair.split_once('=').expect("cookie pair");
                if cookie_value.is_empty() || value.contains("Max-Age=0") {
                    self.0.remove(name);
                } else {
                    self.0.insert(name.to_string(), cookie_value.to_string());
                }
            }
        }

        fn header(&self) -> String {
            self.0
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ")
        }
    }

    fn get(uri: &str, cookies: &Cookies) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::COOKIE, cookies.header())
            .body(Body::empty())
            .expect("request")
    }

    fn login_request(password: &str, cookies: &Cookies) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::COOKIE, cookies.header())
            .body(Body::from(format!(
                "password={}",
                password.replace(' ', "+")
            )))
            .expect("request")
    }

    fn upload_request(parts: &[(&str, Option<&str>, &[u8])], cookies: &Cookies) -> Request<Body> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::COOKIE, cookies.header())
            .body(Body::from(body))
            .expect("request")
    }

    async fn send(app: &Router, request: Request<Body>, cookies: &mut Cookies) -> Response {
        let response = app.clone().oneshot(request).await.expect("response");
        cookies.update(&response);
        response
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf-8 body")
    }

    fn location(response: &Response) -> Option<&str> {
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    async fn logged_in(app: &Router) -> Cookies {
        let mut cookies = Cookies::default();
        let response = send(app, login_request(PASSWORD, &cookies), &mut cookies).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/"));
        assert!(cookies.0.contains_key("DROP_SESSION"));
        cookies
    }

    fn stored_names(root: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(root) else {
            return Vec::new();
        };
        let mut names = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[tokio::test]
    async fn health_is_public_and_static() {
        let (_temp, app) = test_app(1024);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json");
        assert_eq!(body, serde_json::json!({ "status": "healthy" }));
    }

    #[tokio::test]
    async fn upload_page_requires_session_for_every_method() {
        let (temp, app) = test_app(1024 * 1024);
        let mut cookies = Cookies::default();

        let response = send(&app, get("/", &cookies), &mut cookies).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/login"));

        let upload = upload_request(&[("file", Some("scan.pdf"), b"data")], &cookies);
        let response = send(&app, upload, &mut cookies).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/login"));
        assert!(stored_names(&temp.path().join("consume")).is_empty());

        cookies
            .0
            .insert("DROP_SESSION".into(), "4102444800".into());
        let response = send(&app, get("/", &cookies), &mut cookies).await;
        assert_eq!(location(&response), Some("/login"));
    }

    #[tokio::test]
    async fn wrong_password_redirects_back_with_message() {
        let (_temp, app) = test_app(1024);
        let mut cookies = Cookies::default();

        let response = send(&app, login_request("nope", &cookies), &mut cookies).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/login"));
        assert!(!cookies.0.contains_key("DROP_SESSION"));

        let page = send(&app, get("/login", &cookies), &mut cookies).await;
        assert_eq!(page.status(), StatusCode::OK);
        assert!(body_text(page).await.contains("Invalid password. Please try again."));

        let again = send(&app, get("/login", &cookies), &mut cookies).await;
        assert!(!body_text(again).await.contains("Invalid password"));
    }

    #[tokio::test]
    async fn login_upload_and_report() {
        let (temp, app) = test_app(1024 * 1024);
        let mut cookies = logged_in(&app).await;

        let page = send(&app, get("/", &cookies), &mut cookies).await;
        assert_eq!(page.status(), StatusCode::OK);
        let html = body_text(page).await;
        assert!(html.contains("Successfully logged in!"));
        assert!(html.contains("doc, docx, gif, jpeg, jpg, pdf, png, tiff, txt"));

        let upload = upload_request(
            &[
                ("file", Some("Quarterly Report.pdf"), b"%PDF-1.7 report"),
                ("file", Some("installer.exe"), b"MZ"),
                ("file", Some("../notes.txt"), b"plain notes"),
            ],
            &cookies,
        );
        let response = send(&app, upload, &mut cookies).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/"));

        let consume = temp.path().join("consume");
        assert_eq!(
            stored_names(&consume),
            vec!["Quarterly_Report.pdf", "notes.txt"]
        );
        assert_eq!(
            std::fs::read(consume.join("Quarterly_Report.pdf")).expect("read"),
            b"%PDF-1.7 report"
        );

        let page = send(&app, get("/", &cookies), &mut cookies).await;
        let html = body_text(page).await;
        assert!(html.contains("File installer.exe has an invalid extension"));
        assert!(html.contains("Successfully uploaded 2 file(s): Quarterly_Report.pdf, notes.txt"));
    }

    #[tokio::test]
    async fn missing_file_part_and_empty_selection_are_reported() {
        let (temp, app) = test_app(1024 * 1024);
        let mut cookies = logged_in(&app).await;
        send(&app, get("/", &cookies), &mut cookies).await;

        let upload = upload_request(&[("comment", None, b"hello")], &cookies);
        let response = send(&app, upload, &mut cookies).await;
        assert_eq!(location(&response), Some("/"));
        let html = body_text(send(&app, get("/", &cookies), &mut cookies).await).await;
        assert!(html.contains("No file part in the request"));

        let upload = upload_request(&[("file", Some(""), b"")], &cookies);
        send(&app, upload, &mut cookies).await;
        let html = body_text(send(&app, get("/", &cookies), &mut cookies).await).await;
        assert!(html.contains("No file selected"));

        assert!(stored_names(&temp.path().join("consume")).is_empty());
    }

    #[tokio::test]
    async fn non_multipart_post_is_reported_as_missing_file_part() {
        let (temp, app) = test_app(1024 * 1024);
        let mut cookies = logged_in(&app).await;
        send(&app, get("/", &cookies), &mut cookies).await;

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::COOKIE, cookies.header())
            .body(Body::from("comment=hi"))
            .expect("request");
        let response = send(&app, request, &mut cookies).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), Some("/"));

        let html = body_text(send(&app, get("/", &cookies), &mut cookies).await).await;
        assert!(html.contains("No file part in the request"));
        assert!(stored_names(&temp.path().join("consume")).is_empty());
    }

    #[tokio::test]
    async fn oversized_request_writes_nothing() {
        let (temp, app) = test_app(2048);
        let mut cookies = logged_in(&app).await;

        let small = vec![b'a'; 512];
        let large = vec![b'b'; 4096];
        let upload = upload_request(
            &[
                ("file", Some("small.txt"), &small),
                ("file", Some("large.txt"), &large),
            ],
            &cookies,
        );
        let response = send(&app, upload, &mut cookies).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(stored_names(&temp.path().join("consume")).is_empty());
    }

    #[tokio::test]
    async fn eleventh_login_request_is_throttled_before_password_check() {
        let (_temp, app) = test_app(1024);
        let mut cookies = Cookies::default();

        for _ in 0..10 {
            let response = send(&app, get("/login", &cookies), &mut cookies).await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = send(&app, login_request(PASSWORD, &cookies), &mut cookies).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        assert!(!cookies.0.contains_key("DROP_SESSION"));
    }

    #[tokio::test]
    async fn logout_ends_the_session() {
        let (_temp, app) = test_app(1024);
        let mut cookies = logged_in(&app).await;

        let response = send(&app, get("/logout", &cookies), &mut cookies).await;
        assert_eq!(location(&response), Some("/login"));
        assert!(!cookies.0.contains_key("DROP_SESSION"));

        let response = send(&app, get("/", &cookies), &mut cookies).await;
        assert_eq!(location(&response), Some("/login"));

        let page = send(&app, get("/login", &cookies), &mut cookies).await;
        assert!(body_text(page).await.contains("You have been logged out."));
    }

    #[tokio::test]
    async fn responses_carry_security_headers_and_assets_are_served() {
        let (_temp, app) = test_app(1024);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/static/style.css")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/css"))
        );
        assert_eq!(
            response.headers().get(header::X_FRAME_OPTIONS),
            Some(&HeaderValue::from_static("DENY"))
        );
    }
}
