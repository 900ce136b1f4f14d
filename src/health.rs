//! 存活检查。

use axum::response::Json as JsonResponse;
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
}

/// 无条件返回健康状态，不检查任何依赖。
pub async fn health() -> JsonResponse<Health> {
    JsonResponse(Health { status: "healthy" })
}
