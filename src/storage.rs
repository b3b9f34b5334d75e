use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    canonical::{self, Fragment},
    config::{ApiConfig, Config, StorageFormat},
    fingerprint::fingerprint,
};

/// Request headers retained in a stored entry's snapshot.
pub const STORED_REQUEST_HEADERS: &[&str] = &["accept", "content-type", "content-length", "date"];

/// A client request as seen by the storage layer: method, original URL
/// (path plus query), headers, and the collected body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl MockRequest {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }

    fn identity_fingerprint(&self) -> String {
        fingerprint(&[
            Fragment::from_query(canonical::request_query(&self.url)),
            Fragment::from_body(&self.body, self.content_type()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Persistence contract shared by both fixture layouts.
///
/// `save` overwrites any existing entry with the same identity and merges
/// into the current file contents, so a failed write never drops
/// previously stored entries. `get_response` never fails past this
/// boundary: misses and internal read errors both degrade to the
/// deterministic not-found response. `reset` deletes the backing file and
/// treats a missing file as already reset.
pub trait ResponseStore: Send + Sync {
    fn save(&self, request: &MockRequest, response: &MockResponse) -> anyhow::Result<()>;
    fn get_response(&self, request: &MockRequest) -> MockResponse;
    fn reset(&self) -> anyhow::Result<()>;
}

/// Handle running a [`ResponseStore`] off the async request path.
///
/// File I/O stays blocking in the backends; this wrapper moves it onto
/// `spawn_blocking`. Saves are dispatched as detached tasks whose failures
/// are logged, matching the contract that persistence never delays or
/// fails the in-flight response.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn ResponseStore>,
    listen_port: u16,
}

impl Store {
    pub fn from_config(config: &Config, listen_port: u16) -> Self {
        let backend: Arc<dyn ResponseStore> = match config.storage_format() {
            StorageFormat::KeyedJson => Arc::new(KeyedJsonStore::new(
                &config.dir,
                &config.name,
                listen_port,
                UpstreamMeta::from_api(&config.api),
            )),
            StorageFormat::OrderedLog => {
                Arc::new(OrderedLogStore::new(&config.dir, &config.name, listen_port))
            }
        };
        Self {
            backend,
            listen_port,
        }
    }

    /// Persists the pair on a detached blocking task. Failures are logged,
    /// never returned.
    pub fn spawn_save(&self, request: MockRequest, response: MockResponse) {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            match backend.save(&request, &response) {
                Ok(()) => tracing::info!(
                    method = %request.method,
                    url = %request.url,
                    status = response.status,
                    "exchange recorded"
                ),
                Err(err) => tracing::warn!(
                    method = %request.method,
                    url = %request.url,
                    "failed to persist recorded exchange: {err:#}"
                ),
            }
        });
    }

    pub async fn get_response(&self, request: MockRequest) -> MockResponse {
        let backend = Arc::clone(&self.backend);
        let url = request.url.clone();
        match tokio::task::spawn_blocking(move || backend.get_response(&request)).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!("join fixture lookup task: {err}");
                not_found_response(self.listen_port, &url)
            }
        }
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.reset())
            .await
            .context("join fixture reset task")?
    }
}

/// The deterministic response served when no stored entry matches.
pub fn not_found_response(listen_port: u16, url: &str) -> MockResponse {
    let body = serde_json::json!({
        "error": true,
        "message": "Invalid URI. Please correct the requested path.",
        "errorCode": 404,
        "uri": format!("http://localhost:{listen_port}{url}"),
    });
    MockResponse {
        status: 404,
        headers: BTreeMap::from([("content-type".to_owned(), "application/json".to_owned())]),
        body: body.to_string(),
    }
}

/// Keeps only headers whose names appear in `allowed` (case-insensitive),
/// preserving the original name casing.
pub fn filter_headers(
    headers: &BTreeMap<String, String>,
    allowed: &[&str],
) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| allowed.iter().any(|allow| name.eq_ignore_ascii_case(allow)))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create fixture dir {}", parent.display()))?;
    }

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    fs::write(&tmp_path, contents)
        .with_context(|| format!("write fixture store {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace fixture store {}", path.display()))?;
    Ok(())
}

fn remove_store_file(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "fixture store removed");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "fixture store absent; nothing to remove");
            Ok(())
        }
        Err(err) => {
            Err(err).with_context(|| format!("remove fixture store {}", path.display()))
        }
    }
}

/// Upstream connection metadata stamped into a fresh keyed-JSON store for
/// replay context.
#[derive(Debug, Clone)]
pub struct UpstreamMeta {
    pub protocol: String,
    pub hostname: String,
    pub port: Option<u16>,
    pub base: Option<String>,
}

impl UpstreamMeta {
    pub fn from_api(api: &ApiConfig) -> Self {
        Self {
            protocol: api.protocol.scheme().to_owned(),
            hostname: api.hostname.clone(),
            port: api.port,
            base: api.base.clone(),
        }
    }
}

type MethodEntries = BTreeMap<String, BTreeMap<String, KeyedEntry>>;

/// Single JSON document keyed by path -> lowercased method -> fingerprint.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KeyedJsonFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base: Option<String>,
    #[serde(flatten)]
    paths: BTreeMap<String, MethodEntries>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyedEntry {
    headers: BTreeMap<String, String>,
    response: MockResponse,
}

/// Fixture store with O(1) lookup: `<dir>/<name>.json`, exact three-level
/// key match on (path, method, fingerprint).
pub struct KeyedJsonStore {
    file_path: PathBuf,
    listen_port: u16,
    upstream: UpstreamMeta,
}

impl KeyedJsonStore {
    pub fn new(dir: &Path, name: &str, listen_port: u16, upstream: UpstreamMeta) -> Self {
        Self {
            file_path: dir.join(format!("{name}.json")),
            listen_port,
            upstream,
        }
    }

    fn load(&self) -> anyhow::Result<KeyedJsonFile> {
        let text = fs::read_to_string(&self.file_path)
            .with_context(|| format!("read fixture store {}", self.file_path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parse fixture store {}", self.file_path.display()))
    }

    fn fresh_file(&self) -> KeyedJsonFile {
        KeyedJsonFile {
            protocol: Some(self.upstream.protocol.clone()),
            hostname: Some(self.upstream.hostname.clone()),
            port: self.upstream.port,
            base: self.upstream.base.clone(),
            paths: BTreeMap::new(),
        }
    }
}

impl ResponseStore for KeyedJsonStore {
    fn save(&self, request: &MockRequest, response: &MockResponse) -> anyhow::Result<()> {
        let path = canonical::request_path(&request.url).to_owned();
        let method = request.method.to_lowercase();
        let digest = request.identity_fingerprint();

        let mut file = match self.load() {
            Ok(file) => file,
            Err(err) => {
                tracing::debug!("starting a fresh fixture store: {err:#}");
                self.fresh_file()
            }
        };
        file.paths.entry(path).or_default().entry(method).or_default().insert(
            digest,
            KeyedEntry {
                headers: filter_headers(&request.headers, STORED_REQUEST_HEADERS),
                response: response.clone(),
            },
        );

        let serialized =
            serde_json::to_string_pretty(&file).context("serialize fixture store")?;
        write_atomic(&self.file_path, &serialized)
    }

    fn get_response(&self, request: &MockRequest) -> MockResponse {
        let path = canonical::request_path(&request.url);
        let method = request.method.to_lowercase();
        let digest = request.identity_fingerprint();

        match self.load() {
            Ok(file) => {
                let entry = file
                    .paths
                    .get(path)
                    .and_then(|methods| methods.get(&method))
                    .and_then(|entries| entries.get(&digest));
                if let Some(entry) = entry {
                    return entry.response.clone();
                }
                tracing::info!(
                    method = %request.method,
                    path,
                    query = canonical::request_query(&request.url),
                    body = %request.body,
                    "no recorded response for request"
                );
            }
            Err(err) => {
                tracing::warn!("failed to read fixture store (was anything recorded?): {err:#}");
            }
        }
        not_found_response(self.listen_port, &request.url)
    }

    fn reset(&self) -> anyhow::Result<()> {
        remove_store_file(&self.file_path)
    }
}

const MODULE_EXPORT_PREFIX: &str = "module.exports =";

/// Request shape written to the ordered log; `headers` never appears, so
/// matching over these fields alone implements the "everything except
/// headers" comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LogRequest {
    path: String,
    method: String,
    #[serde(
        rename = "queryString",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    query_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LogResponse {
    data: Value,
    status: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LogEntry {
    request: LogRequest,
    response: LogResponse,
}

/// A log file holding exactly one entry is written as a bare object, not a
/// one-element array; both shapes must parse.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LogDocument {
    Many(Vec<LogEntry>),
    One(Box<LogEntry>),
}

/// Flat ordered-log fixture store: `<dir>/<name>.js`, a module-style text
/// wrapper around the entry sequence. Lookup is a full linear scan with
/// structural equality; the last matching entry wins, preserving replay
/// behavior for existing fixture files.
pub struct OrderedLogStore {
    file_path: PathBuf,
    listen_port: u16,
}

impl OrderedLogStore {
    pub fn new(dir: &Path, name: &str, listen_port: u16) -> Self {
        Self {
            file_path: dir.join(format!("{name}.js")),
            listen_port,
        }
    }

    fn load(&self) -> anyhow::Result<Vec<LogEntry>> {
        let text = fs::read_to_string(&self.file_path)
            .with_context(|| format!("read fixture store {}", self.file_path.display()))?;
        parse_log_document(&text)
            .with_context(|| format!("parse fixture store {}", self.file_path.display()))
    }

    fn format_request(&self, request: &MockRequest) -> LogRequest {
        let query = canonical::request_query(&request.url);
        let query = query.strip_prefix('?').unwrap_or(query);
        let params = if request.body.is_empty() {
            None
        } else {
            // Non-JSON bodies are carried as their raw string.
            Some(
                serde_json::from_str(&request.body)
                    .unwrap_or_else(|_| Value::String(request.body.clone())),
            )
        };
        LogRequest {
            path: canonical::request_path(&request.url).to_owned(),
            method: request.method.clone(),
            query_string: (!query.is_empty()).then(|| query.to_owned()),
            params,
        }
    }

    fn format_response(response: &MockResponse) -> LogResponse {
        let data = serde_json::from_str(&response.body)
            .unwrap_or_else(|_| Value::String(response.body.clone()));
        LogResponse {
            data,
            status: response.status,
        }
    }
}

fn parse_log_document(text: &str) -> anyhow::Result<Vec<LogEntry>> {
    let inner = text.trim();
    let inner = inner.strip_prefix(MODULE_EXPORT_PREFIX).unwrap_or(inner);
    let inner = inner.trim().strip_suffix(';').unwrap_or(inner).trim();

    let document: LogDocument = serde_json::from_str(inner).context("parse log entries")?;
    Ok(match document {
        LogDocument::Many(entries) => entries,
        LogDocument::One(entry) => vec![*entry],
    })
}

fn render_log_document(entries: &[LogEntry]) -> anyhow::Result<String> {
    let json = if let [single] = entries {
        serde_json::to_string_pretty(single).context("serialize log entry")?
    } else {
        serde_json::to_string_pretty(entries).context("serialize log entries")?
    };
    Ok(format!("{MODULE_EXPORT_PREFIX} {json};"))
}

/// Structural request equality: object-valued fields compare by their
/// serialized JSON text, scalar fields by value.
fn requests_match(stored: &LogRequest, incoming: &LogRequest) -> bool {
    stored.path == incoming.path
        && stored.method == incoming.method
        && stored.query_string == incoming.query_string
        && params_match(stored.params.as_ref(), incoming.params.as_ref())
}

fn params_match(stored: Option<&Value>, incoming: Option<&Value>) -> bool {
    match (stored, incoming) {
        (None, None) => true,
        (Some(stored), Some(incoming)) => {
            if matches!(stored, Value::Object(_) | Value::Array(_))
                || matches!(incoming, Value::Object(_) | Value::Array(_))
            {
                serde_json::to_string(stored).ok() == serde_json::to_string(incoming).ok()
            } else {
                stored == incoming
            }
        }
        _ => false,
    }
}

impl ResponseStore for OrderedLogStore {
    fn save(&self, request: &MockRequest, response: &MockResponse) -> anyhow::Result<()> {
        let mut entries = match self.load() {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!("starting a fresh fixture store: {err:#}");
                Vec::new()
            }
        };
        entries.push(LogEntry {
            request: self.format_request(request),
            response: Self::format_response(response),
        });

        let rendered = render_log_document(&entries)?;
        write_atomic(&self.file_path, &rendered)
    }

    fn get_response(&self, request: &MockRequest) -> MockResponse {
        let formatted = self.format_request(request);

        match self.load() {
            Ok(entries) => {
                // Full scan; when several entries match, the last one wins.
                let mut found = None;
                for entry in &entries {
                    if requests_match(&entry.request, &formatted) {
                        found = Some(&entry.response);
                    }
                }
                if let Some(response) = found {
                    return MockResponse {
                        status: response.status,
                        headers: BTreeMap::from([(
                            "content-type".to_owned(),
                            "application/json".to_owned(),
                        )]),
                        body: response.data.to_string(),
                    };
                }
                tracing::info!(
                    method = %request.method,
                    url = %request.url,
                    body = %request.body,
                    "no recorded response for request"
                );
            }
            Err(err) => {
                tracing::warn!("failed to read fixture store (was anything recorded?): {err:#}");
            }
        }
        not_found_response(self.listen_port, &request.url)
    }

    fn reset(&self) -> anyhow::Result<()> {
        remove_store_file(&self.file_path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::Value;

    use super::{
        KeyedJsonStore, MockRequest, MockResponse, OrderedLogStore, ResponseStore as _, Store,
        UpstreamMeta, filter_headers,
    };
    use crate::config::Config;

    fn upstream_meta() -> UpstreamMeta {
        UpstreamMeta {
            protocol: "https".to_owned(),
            hostname: "api.example.com".to_owned(),
            port: Some(443),
            base: Some("/v1".to_owned()),
        }
    }

    fn request(method: &str, url: &str, body: &str) -> MockRequest {
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_owned(), "application/json".to_owned());
        if !body.is_empty() {
            headers.insert("content-type".to_owned(), "application/json".to_owned());
        }
        MockRequest {
            method: method.to_owned(),
            url: url.to_owned(),
            headers,
            body: body.to_owned(),
        }
    }

    fn response(status: u16, body: &str) -> MockResponse {
        MockResponse {
            status,
            headers: BTreeMap::from([(
                "content-type".to_owned(),
                "application/json".to_owned(),
            )]),
            body: body.to_owned(),
        }
    }

    #[test]
    fn keyed_save_then_get_round_trips_the_response() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        let req = request("GET", "/user/profile?user=1", "");
        let res = response(200, r#"{"name":"ada"}"#);
        store.save(&req, &res).unwrap();

        assert_eq!(store.get_response(&req), res);
    }

    #[test]
    fn keyed_identity_ignores_query_parameter_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        let recorded = request("GET", "/user/profile?b=2&a=1", "");
        let res = response(200, "profile");
        store.save(&recorded, &res).unwrap();

        let reordered = request("GET", "/user/profile?a=1&b=2", "");
        assert_eq!(store.get_response(&reordered), res);
    }

    #[test]
    fn keyed_identity_ignores_json_body_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        let recorded = request("POST", "/user/login", r#"{"b":2,"a":1}"#);
        let res = response(201, "created");
        store.save(&recorded, &res).unwrap();

        let reordered = request("POST", "/user/login", r#"{"a":1,"b":2}"#);
        assert_eq!(store.get_response(&reordered), res);
    }

    #[test]
    fn keyed_method_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        let recorded = request("POST", "/user/login", "");
        store.save(&recorded, &response(200, "ok")).unwrap();

        let lowercase = request("post", "/user/login", "");
        assert_eq!(store.get_response(&lowercase).status, 200);
    }

    #[test]
    fn keyed_same_identity_overwrites_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        let req = request("GET", "/user/profile", "");
        store.save(&req, &response(200, "first")).unwrap();
        store.save(&req, &response(200, "second")).unwrap();

        assert_eq!(store.get_response(&req).body, "second");
    }

    #[test]
    fn keyed_miss_returns_not_found_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8123, upstream_meta());

        let res = store.get_response(&request("GET", "/missing?x=1", ""));

        assert_eq!(res.status, 404);
        assert_eq!(
            res.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        let body: Value = serde_json::from_str(&res.body).unwrap();
        assert_eq!(body["error"], Value::Bool(true));
        assert_eq!(body["errorCode"], 404);
        assert_eq!(body["uri"], "http://localhost:8123/missing?x=1");
        assert!(
            body["message"]
                .as_str()
                .unwrap()
                .contains("Invalid URI"),
        );
    }

    #[test]
    fn keyed_corrupt_store_is_replaced_fresh_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());
        std::fs::write(dir.path().join("response.json"), "not json at all").unwrap();

        let req = request("GET", "/user/profile", "");
        let res = response(200, "ok");
        store.save(&req, &res).unwrap();

        assert_eq!(store.get_response(&req), res);
    }

    #[test]
    fn keyed_fresh_file_stamps_upstream_metadata_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        let req = request("POST", "/user/login?next=home", r#"{"user":"ada"}"#);
        store.save(&req, &response(200, "ok")).unwrap();

        let text = std::fs::read_to_string(dir.path().join("response.json")).unwrap();
        let file: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(file["protocol"], "https");
        assert_eq!(file["hostname"], "api.example.com");
        assert_eq!(file["port"], 443);
        assert_eq!(file["base"], "/v1");

        // One entry under [path][lowercased method][fingerprint].
        let methods = file["/user/login"].as_object().unwrap();
        let entries = methods["post"].as_object().unwrap();
        assert_eq!(entries.len(), 1);
        let entry = entries.values().next().unwrap();
        assert_eq!(entry["response"]["status"], 200);
    }

    #[test]
    fn keyed_stored_request_headers_are_whitelisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        let mut req = request("GET", "/user/profile", "");
        req.headers
            .insert("authorization".to_owned(), "Bearer secret".to_owned());
        req.headers
            .insert("date".to_owned(), "Mon, 01 Jan 2024 00:00:00 GMT".to_owned());
        store.save(&req, &response(200, "ok")).unwrap();

        let text = std::fs::read_to_string(dir.path().join("response.json")).unwrap();
        let file: Value = serde_json::from_str(&text).unwrap();
        let entry = file["/user/profile"]["get"]
            .as_object()
            .unwrap()
            .values()
            .next()
            .unwrap();
        let headers = entry["headers"].as_object().unwrap();

        assert!(headers.contains_key("accept"));
        assert!(headers.contains_key("date"));
        assert!(!headers.contains_key("authorization"));
    }

    #[test]
    fn keyed_reset_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyedJsonStore::new(dir.path(), "response", 8000, upstream_meta());

        // No file yet.
        store.reset().unwrap();

        store
            .save(&request("GET", "/user/profile", ""), &response(200, "ok"))
            .unwrap();
        assert!(dir.path().join("response.json").exists());

        store.reset().unwrap();
        assert!(!dir.path().join("response.json").exists());
        store.reset().unwrap();
    }

    #[test]
    fn log_single_entry_is_written_as_bare_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        store
            .save(
                &request("GET", "/user/profile?user=1", ""),
                &response(200, r#"{"name":"ada"}"#),
            )
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("response.js")).unwrap();
        assert!(text.starts_with("module.exports = {"), "content: {text}");
        assert!(text.trim_end().ends_with(';'), "content: {text}");
    }

    #[test]
    fn log_second_entry_promotes_the_file_to_an_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        store
            .save(&request("GET", "/a", ""), &response(200, "one"))
            .unwrap();
        store
            .save(&request("GET", "/b", ""), &response(200, "two"))
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("response.js")).unwrap();
        assert!(text.starts_with("module.exports = ["), "content: {text}");

        // Both entries remain retrievable.
        assert_eq!(store.get_response(&request("GET", "/a", "")).status, 200);
        assert_eq!(store.get_response(&request("GET", "/b", "")).status, 200);
    }

    #[test]
    fn log_lookup_matches_on_non_header_fields_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        let mut recorded = request("GET", "/user/profile?user=1", "");
        recorded
            .headers
            .insert("x-request-id".to_owned(), "aaa".to_owned());
        store.save(&recorded, &response(200, r#"{"name":"ada"}"#)).unwrap();

        let mut lookup = request("GET", "/user/profile?user=1", "");
        lookup
            .headers
            .insert("x-request-id".to_owned(), "bbb".to_owned());
        let res = store.get_response(&lookup);

        assert_eq!(res.status, 200);
        assert_eq!(res.body, r#"{"name":"ada"}"#);
        assert_eq!(
            res.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn log_differing_query_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        store
            .save(&request("GET", "/user/profile?user=1", ""), &response(200, "ok"))
            .unwrap();

        let res = store.get_response(&request("GET", "/user/profile?user=2", ""));
        assert_eq!(res.status, 404);
        assert!(res.body.contains(r#""errorCode":404"#), "body: {}", res.body);
    }

    #[test]
    fn log_last_matching_entry_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        let req = request("GET", "/user/profile", "");
        store.save(&req, &response(200, r#""first""#)).unwrap();
        store.save(&req, &response(200, r#""second""#)).unwrap();

        assert_eq!(store.get_response(&req).body, r#""second""#);
    }

    #[test]
    fn log_json_body_becomes_params_and_matches_by_serialized_equality() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        store
            .save(
                &request("POST", "/user/login", r#"{"user":"ada","pass":"x"}"#),
                &response(200, r#"{"token":"t"}"#),
            )
            .unwrap();

        let hit = store.get_response(&request(
            "POST",
            "/user/login",
            r#"{"user":"ada","pass":"x"}"#,
        ));
        assert_eq!(hit.status, 200);

        let miss = store.get_response(&request(
            "POST",
            "/user/login",
            r#"{"user":"eve","pass":"x"}"#,
        ));
        assert_eq!(miss.status, 404);
    }

    #[test]
    fn log_non_json_body_is_carried_as_a_string_param() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        let mut recorded = request("POST", "/notes", "");
        recorded.body = "plain text".to_owned();
        store.save(&recorded, &response(201, "stored")).unwrap();

        let text = std::fs::read_to_string(dir.path().join("response.js")).unwrap();
        assert!(text.contains(r#""params": "plain text""#), "content: {text}");

        assert_eq!(store.get_response(&recorded).status, 201);
    }

    #[test]
    fn log_query_string_is_omitted_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        store
            .save(&request("GET", "/plain", ""), &response(200, "ok"))
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join("response.js")).unwrap();
        assert!(!text.contains("queryString"), "content: {text}");

        store
            .save(&request("GET", "/with?user=1", ""), &response(200, "ok"))
            .unwrap();
        let text = std::fs::read_to_string(dir.path().join("response.js")).unwrap();
        assert!(text.contains(r#""queryString": "user=1""#), "content: {text}");
    }

    #[test]
    fn log_corrupt_wrapper_is_replaced_fresh_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);
        std::fs::write(dir.path().join("response.js"), "exports = oops").unwrap();

        let req = request("GET", "/user/profile", "");
        store.save(&req, &response(200, "ok")).unwrap();

        assert_eq!(store.get_response(&req).status, 200);
    }

    #[test]
    fn log_reset_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderedLogStore::new(dir.path(), "response", 8000);

        store.reset().unwrap();
        store
            .save(&request("GET", "/a", ""), &response(200, "ok"))
            .unwrap();
        store.reset().unwrap();
        assert!(!dir.path().join("response.js").exists());
        store.reset().unwrap();
    }

    #[test]
    fn filter_headers_is_case_insensitive_and_preserves_casing() {
        let headers = BTreeMap::from([
            ("Accept".to_owned(), "application/json".to_owned()),
            ("Authorization".to_owned(), "Bearer secret".to_owned()),
            ("content-type".to_owned(), "text/plain".to_owned()),
        ]);

        let filtered = filter_headers(&headers, &["accept", "content-type"]);

        assert_eq!(
            filtered,
            BTreeMap::from([
                ("Accept".to_owned(), "application/json".to_owned()),
                ("content-type".to_owned(), "text/plain".to_owned()),
            ])
        );
    }

    #[tokio::test]
    async fn store_selects_backend_from_config_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_toml_str(&format!(
            r#"
port = 8000
dir = "{}"

[api]
protocol = "https"
hostname = "api.example.com"
"#,
            dir.path().display()
        ))
        .expect("config should parse");

        let store = Store::from_config(&config, 8000);
        let req = request("GET", "/user/profile", "");
        let miss = store.get_response(req.clone()).await;
        assert_eq!(miss.status, 404);

        store.spawn_save(req.clone(), response(200, "ok"));
        // The save runs on a detached blocking task.
        for _ in 0..100 {
            if dir.path().join("response.json").exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let hit = store.get_response(req).await;
        assert_eq!(hit.status, 200);

        store.reset().await.expect("reset should succeed");
        store.reset().await.expect("second reset should succeed");
    }
}
