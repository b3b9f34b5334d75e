use serde_json::Value;

/// A request fragment tagged with how it canonicalizes.
///
/// Replay identity must not depend on the order a client happened to emit
/// query parameters or JSON object keys in, so each fragment kind carries
/// its own order-normalization:
/// - `Query`: `key=value` pairs sorted as opaque strings
/// - `Json`: objects rebuilt with sorted keys, arrays sorted by the
///   serialized form of their elements
/// - `Raw`: used verbatim
///
/// Dispatch is by declared content type; anything unrecognized falls back
/// to `Raw`. A body that claims to be JSON but does not parse also
/// degrades to `Raw` rather than failing the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Query(String),
    Json(String),
    Raw(String),
}

impl Fragment {
    /// Wraps a request body, picking the fragment kind from the declared
    /// content type (`contains` match, so parameterized types like
    /// `application/json; charset=utf-8` are recognized).
    pub fn from_body(body: &str, content_type: Option<&str>) -> Self {
        match content_type {
            Some(kind) if kind.contains("application/x-www-form-urlencoded") => {
                Self::Query(body.to_owned())
            }
            Some(kind) if kind.contains("application/json") => Self::Json(body.to_owned()),
            _ => Self::Raw(body.to_owned()),
        }
    }

    /// Wraps a raw query string. A leading `?` is tolerated.
    pub fn from_query(query: &str) -> Self {
        Self::Query(query.to_owned())
    }

    /// The byte-stable canonical text of this fragment. Idempotent, and
    /// identical for any two fragments that differ only in pair or key
    /// order.
    pub fn canonical(&self) -> String {
        match self {
            Self::Query(query) => canonical_query(query),
            Self::Json(body) => canonical_json(body),
            Self::Raw(body) => body.clone(),
        }
    }
}

fn canonical_query(query: &str) -> String {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut pairs: Vec<&str> = query.split('&').collect();
    pairs.sort_unstable();
    pairs.join("&")
}

fn canonical_json(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_owned();
    };
    serde_json::to_string(&sort_value(value)).unwrap_or_else(|_| body.to_owned())
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map
                .into_iter()
                .map(|(key, value)| (key, sort_value(value)))
                .collect();
            entries.sort_by(|(left, _), (right, _)| left.cmp(right));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => {
            let mut items: Vec<Value> = items.into_iter().map(sort_value).collect();
            items.sort_by_cached_key(|item| serde_json::to_string(item).unwrap_or_default());
            Value::Array(items)
        }
        other => other,
    }
}

/// Path portion of a request URL, query stripped.
/// `/user/profile?user=1` -> `/user/profile`.
pub fn request_path(url: &str) -> &str {
    match url.find('?') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

/// Query portion of a request URL including the leading `?`, or the empty
/// string when the URL carries none.
pub fn request_query(url: &str) -> &str {
    match url.find('?') {
        Some(idx) => &url[idx..],
        None => "",
    }
}
