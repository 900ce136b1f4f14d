//! 嵌入式页面模板与静态资源。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{Html, IntoResponse, Response};
use axum_extra::extract::cookie::SignedCookieJar;
use rust_embed::RustEmbed;
use std::sync::Arc;

use crate::auth::SessionGate;
use crate::error::ApiError;
use crate::flash::{self, Flash};
use crate::upload::UploadConfig;

#[derive(RustEmbed)]
#[folder = "assets"]
/// 嵌入式模板与样式。
pub struct Assets;

/// 登录页。
pub async fn login_page(
    Extension(gate): Extension<Arc<SessionGate>>,
    headers: HeaderMap,
) -> Result<(SignedCookieJar, Html<String>), ApiError> {
    let (jar, flashes) = flash::take(gate.cookie_jar(&headers));
    let page = render("templates/login.html", &[("messages", render_flashes(&flashes))])?;
    Ok((jar, Html(page)))
}

/// 上传页：列出允许的扩展名。
pub async fn upload_page(
    Extension(gate): Extension<Arc<SessionGate>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    headers: HeaderMap,
) -> Result<(SignedCookieJar, Html<String>), ApiError> {
    let (jar, flashes) = flash::take(gate.cookie_jar(&headers));
    let extensions = upload.allowed.to_string();
    let accept = upload
        .allowed
        .iter()
        .map(|ext| format!(".{ext}"))
        .collect::<Vec<_>>()
        .join(",");
    let page = render(
        "templates/upload.html",
        &[
            ("messages", render_flashes(&flashes)),
            ("extensions", escape_html(&extensions)),
            ("accept", escape_html(&accept)),
            ("max_size", format_size(upload.max_request_size)),
        ],
    )?;
    Ok((jar, Html(page)))
}

/// 静态资源（仅 `static/` 目录）。
pub async fn serve_asset(Path(path): Path<String>) -> Result<Response, ApiError> {
    let full_path = format!("static/{path}");
    let asset = Assets::get(&full_path).ok_or_else(|| ApiError::NotFound("not found".into()))?;
    let mime = mime_guess::from_path(&full_path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    Ok((headers, AxumBody::from(asset.data.into_owned())).into_response())
}

/// Substitutes `{{name}}` placeholders in a single pass; values are inserted verbatim.
fn render(template: &str, vars: &[(&str, String)]) -> Result<String, ApiError> {
    let asset = Assets::get(template)
        .ok_or_else(|| ApiError::Internal(format!("missing template {template}")))?;
    let source = std::str::from_utf8(&asset.data)
        .map_err(|err| ApiError::Internal(format!("template {template} is not utf-8: {err}")))?;

    let mut output = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            output.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = after[..end].trim();
        match vars.iter().find(|(name, _)| *name == key) {
            Some((_, value)) => output.push_str(value),
            None => output.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

fn render_flashes(flashes: &[Flash]) -> String {
    flashes
        .iter()
        .map(|flash| {
            format!(
                "<div class=\"flash flash-{}\">{}</div>",
                flash.level.as_str(),
                escape_html(&flash.message)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn format_size(bytes: usize) -> String {
    const MIB: usize = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MB", bytes / MIB)
    } else if bytes >= MIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else {
        format!("{} KB", bytes.div_ceil(1024))
    }
}
