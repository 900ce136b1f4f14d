//! 一次性提示消息：跨一次重定向，渲染后即删除。

use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::config::FLASH_COOKIE_NAME;

/// Keeps the signed cookie well under the 4 KiB browsers accept.
const FLASH_COOKIE_BUDGET: usize = 3000;
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Info,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Success => "success",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub level: Level,
    pub message: String,
}

impl Flash {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(Level::Success, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Level::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Level::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Level::Error, message)
    }
}

/// 追加消息；超出大小预算时丢弃最早的消息，仍超出则截断最后一条。
pub fn push(jar: SignedCookieJar, messages: impl IntoIterator<Item = Flash>) -> SignedCookieJar {
    let mut pending = read(&jar);
    pending.extend(messages);

    let mut encoded = encode(&pending);
    while encoded.len() > FLASH_COOKIE_BUDGET && pending.len() > 1 {
        pending.remove(0);
        encoded = encode(&pending);
    }
    while encoded.len() > FLASH_COOKIE_BUDGET {
        let Some(last) = pending.last_mut() else {
            break;
        };
        let length = last.message.chars().count();
        if length <= ELLIPSIS.len() {
            pending.clear();
        } else {
            // base64 adds a third on top of the JSON bytes.
            let excess = (encoded.len() - FLASH_COOKIE_BUDGET) * 3 / 4 + 1;
            let keep = length.saturating_sub(excess + ELLIPSIS.len());
            let mut shortened = last.message.chars().take(keep).collect::<String>();
            shortened.push_str(ELLIPSIS);
            last.message = shortened;
        }
        encoded = encode(&pending);
    }

    jar.add(
        Cookie::build((FLASH_COOKIE_NAME, encoded))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Strict),
    )
}

/// 取出全部待显示消息并清除 Cookie。
pub fn take(jar: SignedCookieJar) -> (SignedCookieJar, Vec<Flash>) {
    if jar.get(FLASH_COOKIE_NAME).is_none() {
        return (jar, Vec::new());
    }
    let pending = read(&jar);
    (
        jar.remove(Cookie::build(FLASH_COOKIE_NAME).path("/")),
        pending,
    )
}

fn read(jar: &SignedCookieJar) -> Vec<Flash> {
    jar.get(FLASH_COOKIE_NAME)
        .and_then(|cookie| URL_SAFE_NO_PAD.decode(cookie.value()).ok())
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn encode(messages: &[Flash]) -> String {
    serde_json::to_vec(messages)
        .map(|bytes| URL_SAFE_NO_PAD.encode(bytes))
        .unwrap_or_default()
}
