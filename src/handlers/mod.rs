// src/handlers/mod.rs
//! Thin axum handlers. Every JSON answer uses the `{code, msg, data, ts}`
//! envelope; errors are rendered by `AppError`.

pub mod federation;
pub mod flow;
pub mod forwards;
pub mod nodes;
pub mod permissions;
pub mod tunnels;
pub mod users;

use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::utils::now_millis;

pub type ApiResult = Result<Json<Value>, AppError>;

pub fn success<T: Serialize>(data: T) -> ApiResult {
    let data = serde_json::to_value(data)?;
    Ok(Json(json!({
        "code": 0,
        "msg": "success",
        "data": data,
        "ts": now_millis(),
    })))
}

pub fn done() -> ApiResult {
    success(Value::Null)
}
