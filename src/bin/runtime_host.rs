//! Runtime host - the in-sandbox HTTP server that executes a user function.
//!
//! Spawned once per instance by the process or container executor with its
//! wire contract passed through environment variables (`RUNTIME_PORT`,
//! `FUNCTION_PATH`, `FUNCTION_NAME`, `FUNCTION_TIMEOUT`, ...). User code is a
//! Rhai script exposing a function by the configured name; the script is
//! recompiled whenever its file's modification time advances, mirroring the
//! reload-on-change behavior of the dynamic loader it's grounded on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::{json, Value};
use tracing::{error, info, warn};

struct FunctionLoader {
    path: PathBuf,
    function_name: String,
    engine: Engine,
    loaded: Mutex<Option<(AST, SystemTime)>>,
}

#[derive(Debug)]
enum LoadError {
    NotFound(PathBuf),
    Compile(String),
    MissingFunction(String),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::NotFound(p) => write!(f, "function file not found: {}", p.display()),
            LoadError::Compile(msg) => write!(f, "function compile error: {msg}"),
            LoadError::MissingFunction(name) => write!(f, "function '{name}' not found in script"),
        }
    }
}

impl FunctionLoader {
    fn new(path: PathBuf, function_name: String) -> Self {
        Self {
            path,
            function_name,
            engine: Engine::new(),
            loaded: Mutex::new(None),
        }
    }

    /// Recompiles the script if it's missing or the file's mtime advanced.
    fn ensure_loaded(&self) -> Result<AST, LoadError> {
        let metadata = std::fs::metadata(&self.path).map_err(|_| LoadError::NotFound(self.path.clone()))?;
        let modified = metadata.modified().unwrap_or(SystemTime::now());

        let mut guard = self.loaded.lock();
        let needs_reload = match &*guard {
            Some((_, last_modified)) => modified > *last_modified,
            None => true,
        };

        if needs_reload {
            info!(path = %self.path.display(), "loading function script");
            let source = std::fs::read_to_string(&self.path).map_err(|_| LoadError::NotFound(self.path.clone()))?;
            let ast = self
                .engine
                .compile(&source)
                .map_err(|e| LoadError::Compile(e.to_string()))?;

            if !ast.iter_functions().any(|f| f.name == self.function_name) {
                return Err(LoadError::MissingFunction(self.function_name.clone()));
            }

            *guard = Some((ast.clone(), modified));
            return Ok(ast);
        }

        Ok(guard.as_ref().unwrap().0.clone())
    }

    fn call(&self, request: Dynamic) -> Result<Dynamic, String> {
        let ast = self.ensure_loaded().map_err(|e| e.to_string())?;
        let mut scope = Scope::new();
        self.engine
            .call_fn(&mut scope, &ast, &self.function_name, (request,))
            .map_err(|e| e.to_string())
    }
}

struct HostConfig {
    port: u16,
    host: String,
    function_path: PathBuf,
    function_name: String,
    timeout_seconds: u64,
    execution_mode: String,
    runtime_id: String,
}

impl HostConfig {
    fn from_env() -> Self {
        Self {
            port: std::env::var("RUNTIME_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080),
            host: std::env::var("RUNTIME_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            function_path: std::env::var("FUNCTION_PATH")
                .unwrap_or_else(|_| "/tmp/user_function.rhai".into())
                .into(),
            function_name: std::env::var("FUNCTION_NAME").unwrap_or_else(|_| "handle".into()),
            timeout_seconds: std::env::var("FUNCTION_TIMEOUT").ok().and_then(|v| v.parse().ok()).unwrap_or(30),
            execution_mode: std::env::var("EXECUTION_MODE").unwrap_or_else(|_| "unknown".into()),
            runtime_id: std::env::var("RUNTIME_ID").unwrap_or_else(|_| "unknown".into()),
        }
    }
}

#[derive(Clone)]
struct AppState {
    loader: Arc<FunctionLoader>,
    timeout: Duration,
}

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "runtime": "rhai",
        "version": "1.0.0",
        "timestamp": now_epoch(),
    }))
}

async fn invoke(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.as_str().to_lowercase(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let body_text = String::from_utf8_lossy(&body).into_owned();

    let mut request_map = rhai::Map::new();
    request_map.insert("method".into(), "POST".into());
    request_map.insert("path".into(), "/".into());
    request_map.insert("body".into(), body_text.clone().into());
    let mut headers_map = rhai::Map::new();
    for (k, v) in &header_map {
        headers_map.insert(k.as_str().into(), v.clone().into());
    }
    request_map.insert("headers".into(), headers_map.into());
    let mut query_map = rhai::Map::new();
    for (k, v) in &query {
        query_map.insert(k.as_str().into(), v.clone().into());
    }
    request_map.insert("query".into(), query_map.into());

    let loader = state.loader.clone();
    let request = Dynamic::from(request_map);

    let result = tokio::time::timeout(
        state.timeout,
        tokio::task::spawn_blocking(move || loader.call(request)),
    )
    .await;

    match result {
        Ok(Ok(Ok(value))) => dynamic_to_response(value),
        Ok(Ok(Err(msg))) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
        Ok(Err(join_err)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &join_err.to_string()),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("function execution timeout ({}s)", state.timeout.as_secs()),
        ),
    }
}

fn dynamic_to_response(value: Dynamic) -> Response {
    if value.is::<rhai::Map>() || value.is::<rhai::Array>() {
        let json_value = dynamic_to_json(&value);
        Json(json_value).into_response()
    } else if let Some(s) = value.clone().try_cast::<String>() {
        ([("content-type", "text/plain")], s).into_response()
    } else if let Some(blob) = value.clone().try_cast::<rhai::Blob>() {
        ([("content-type", "application/octet-stream")], blob).into_response()
    } else {
        ([("content-type", "text/plain")], value.to_string()).into_response()
    }
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k.to_string(), dynamic_to_json(&v));
        }
        Value::Object(obj)
    } else if let Some(arr) = value.clone().try_cast::<rhai::Array>() {
        Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if let Some(s) = value.clone().try_cast::<String>() {
        Value::String(s)
    } else if let Some(i) = value.clone().try_cast::<i64>() {
        json!(i)
    } else if let Some(f) = value.clone().try_cast::<f64>() {
        json!(f)
    } else if let Some(b) = value.clone().try_cast::<bool>() {
        Value::Bool(b)
    } else {
        Value::String(value.to_string())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = Json(json!({
        "error": message,
        "status": status.as_u16(),
        "timestamp": now_epoch(),
    }));
    (status, body).into_response()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "runtime_host=info".into()),
        )
        .init();

    let config = HostConfig::from_env();

    info!("Runtime host initialized:");
    info!("  - Port: {}", config.port);
    info!("  - Host: {}", config.host);
    info!("  - Function path: {}", config.function_path.display());
    info!("  - Function name: {}", config.function_name);
    info!("  - Timeout: {}s", config.timeout_seconds);
    info!("  - Execution mode: {}", config.execution_mode);
    info!("  - Runtime id: {}", config.runtime_id);

    if !config.function_path.is_file() {
        error!("function file not found: {}", config.function_path.display());
        std::process::exit(1);
    }

    let loader = Arc::new(FunctionLoader::new(config.function_path.clone(), config.function_name.clone()));
    if let Err(e) = loader.ensure_loaded() {
        error!("function validation failed: {e}");
        std::process::exit(1);
    }
    info!("function validation successful");

    let state = AppState {
        loader,
        timeout: Duration::from_secs(config.timeout_seconds),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/", get(health))
        .route("/", post(invoke))
        .with_state(state);

    let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("runtime host started on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    warn!("runtime host stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(path: &std::path::Path, body: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn loads_and_calls_a_function() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fn.rhai");
        write_script(&path, "fn handle(req) { #{ echo: req.body } }");

        let loader = FunctionLoader::new(path, "handle".into());
        let mut request = rhai::Map::new();
        request.insert("body".into(), "hi".into());

        let result = loader.call(Dynamic::from(request)).unwrap();
        let map = result.cast::<rhai::Map>();
        assert_eq!(map["echo"].clone().cast::<String>(), "hi");
    }

    #[test]
    fn missing_function_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fn.rhai");
        write_script(&path, "fn other() { 1 }");

        let loader = FunctionLoader::new(path, "handle".into());
        let err = loader.ensure_loaded().unwrap_err();
        assert!(matches!(err, LoadError::MissingFunction(_)));
    }

    #[test]
    fn reloads_when_mtime_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fn.rhai");
        write_script(&path, "fn handle(req) { 1 }");

        let loader = FunctionLoader::new(path.clone(), "handle".into());
        let first = loader.call(Dynamic::UNIT).unwrap();
        assert_eq!(first.cast::<i64>(), 1);

        // Bump mtime into the future so the reload check fires regardless of
        // filesystem timestamp resolution.
        let future = SystemTime::now() + Duration::from_secs(5);
        write_script(&path, "fn handle(req) { 2 }");
        let file = std::fs::File::open(&path).unwrap();
        file.set_modified(future).unwrap();

        let second = loader.call(Dynamic::UNIT).unwrap();
        assert_eq!(second.cast::<i64>(), 2);
    }

    #[test]
    fn dynamic_to_json_converts_nested_map() {
        let mut inner = rhai::Map::new();
        inner.insert("n".into(), (7_i64).into());
        let mut outer = rhai::Map::new();
        outer.insert("ok".into(), true.into());
        outer.insert("nested".into(), inner.into());

        let json = dynamic_to_json(&Dynamic::from(outer));
        assert_eq!(json["ok"], serde_json::json!(true));
        assert_eq!(json["nested"]["n"], serde_json::json!(7));
    }
}
