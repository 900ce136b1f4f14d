//! 共享密码登录、签名会话 Cookie 与访问控制中间件。

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use axum::body::Body as AxumBody;
use axum::extract::{Extension, Form};
use axum::http::{HeaderMap, Request};
use axum::response::{IntoResponse, Redirect, Response};
use axum::middleware;
use axum_extra::extract::cookie::{Cookie, Key, SameSite, SignedCookieJar};
use chrono::Utc;
use cookie::time::Duration as CookieDuration;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SESSION_COOKIE_NAME;
use crate::error::ApiError;
use crate::flash::{self, Flash};
use crate::http::is_https_request;

/// 单一共享凭据与会话签名密钥，启动后不可变。
pub struct SessionGate {
    password_hash: Arc<str>,
    key: Key,
    session_ttl: Duration,
    trust_proxy: bool,
}

#[derive(Debug)]
pub enum AuthError {
    InvalidPassword,
    Internal(String),
}

impl SessionGate {
    /// `secret_key` must be at least 32 bytes; config validation enforces it.
    pub fn new(
        password_hash: String,
        secret_key: &str,
        session_ttl: Duration,
        trust_proxy: bool,
    ) -> Self {
        Self {
            password_hash: password_hash.into(),
            key: Key::derive_from(secret_key.as_bytes()),
            session_ttl,
            trust_proxy,
        }
    }

    /// `Secure` only when a trusted proxy reports HTTPS.
    pub fn secure_cookies(&self, headers: &HeaderMap) -> bool {
        is_https_request(headers, self.trust_proxy)
    }

    /// 读取请求中的签名 Cookie；签名无效的 Cookie 会被忽略。
    pub fn cookie_jar(&self, headers: &HeaderMap) -> SignedCookieJar {
        SignedCookieJar::from_headers(headers, self.key.clone())
    }

    /// 校验密码；不区分失败原因。
    pub async fn authenticate(&self, password: &str) -> Result<(), AuthError> {
        let hash = self.password_hash.clone();
        let password = password.to_owned();
        let matched = tokio::task::spawn_blocking(move || verify_password(&hash, &password))
            .await
            .map_err(|err| AuthError::Internal(err.to_string()))??;
        if matched {
            Ok(())
        } else {
            Err(AuthError::InvalidPassword)
        }
    }

    /// 会话有效：签名正确且未过期。
    pub fn has_session(&self, jar: &SignedCookieJar) -> bool {
        jar.get(SESSION_COOKIE_NAME)
            .and_then(|cookie| cookie.value().parse::<i64>().ok())
            .is_some_and(|expires_at| expires_at > Utc::now().timestamp())
    }

    pub fn start_session(&self, jar: SignedCookieJar, secure: bool) -> SignedCookieJar {
        let ttl_secs = i64::try_from(self.session_ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = Utc::now().timestamp().saturating_add(ttl_secs);
        let cookie = Cookie::build((SESSION_COOKIE_NAME, expires_at.to_string()))
            .path("/")
            .http_only(true)
            .secure(secure)
            .same_site(SameSite::Strict)
            .max_age(CookieDuration::seconds(ttl_secs));
        jar.add(cookie)
    }

    pub fn end_session(&self, jar: SignedCookieJar) -> SignedCookieJar {
        jar.remove(Cookie::build(SESSION_COOKIE_NAME).path("/"))
    }
}

fn verify_password(hash: &str, password: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|err| AuthError::Internal(err.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[derive(Deserialize)]
pub(crate) struct LoginForm {
    #[serde(default)]
    password: String,
}

/// 登录提交：成功写入会话并跳转上传页，失败带提示返回登录页。
pub async fn login_submit(
    Extension(gate): Extension<Arc<SessionGate>>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Result<(SignedCookieJar, Redirect), ApiError> {
    let jar = gate.cookie_jar(&headers);
    match gate.authenticate(&form.password).await {
        Ok(()) => {
            info!("login succeeded");
            let jar = gate.start_session(jar, gate.secure_cookies(&headers));
            let jar = flash::push(jar, [Flash::success("Successfully logged in!")]);
            Ok((jar, Redirect::to("/")))
        }
        Err(AuthError::InvalidPassword) => {
            warn!("login failed: invalid password");
            let jar = flash::push(jar, [Flash::error("Invalid password. Please try again.")]);
            Ok((jar, Redirect::to("/login")))
        }
        Err(err) => Err(err.into()),
    }
}

/// 登出：删除会话 Cookie。
pub async fn logout(
    Extension(gate): Extension<Arc<SessionGate>>,
    headers: HeaderMap,
) -> (SignedCookieJar, Redirect) {
    let jar = gate.end_session(gate.cookie_jar(&headers));
    let jar = flash::push(jar, [Flash::info("You have been logged out.")]);
    (jar, Redirect::to("/login"))
}

/// 会话中间件：无有效会话时一律跳转登录页。
pub async fn require_session(
    Extension(gate): Extension<Arc<SessionGate>>,
    req: Request<AxumBody>,
    next: middleware::Next,
) -> Response {
    let jar = gate.cookie_jar(req.headers());
    if gate.has_session(&jar) {
        return next.run(req).await;
    }
    debug!(method = %req.method(), path = req.uri().path(), "no session, redirecting to login");
    Redirect::to("/login").into_response()
}
