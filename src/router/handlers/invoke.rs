use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::router::AppState;

/// Dispatches to the named function, merging request metadata (method, path,
/// headers, query) into the forwarded body per the dispatch contract.
pub async fn invoke(
    State(state): State<AppState>,
    Path(function_name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let header_map: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let parsed_body: Value = serde_json::from_slice(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));

    let request_data = match parsed_body {
        Value::Object(mut map) => {
            map.insert("method".into(), json!("POST"));
            map.insert("path".into(), json!(format!("/invoke/{function_name}")));
            map.insert("headers".into(), json!(header_map));
            map.insert("query".into(), json!(query));
            Value::Object(map)
        }
        other => {
            let mut map = Map::new();
            map.insert("body".into(), other);
            map.insert("method".into(), json!("POST"));
            map.insert("path".into(), json!(format!("/invoke/{function_name}")));
            map.insert("headers".into(), json!(header_map));
            map.insert("query".into(), json!(query));
            Value::Object(map)
        }
    };

    let (status, response_body) = state
        .orchestrator
        .invoke(&function_name, request_data, header_map)
        .await?;

    let status = axum::http::StatusCode::from_u16(status)
        .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(response_body)))
}
