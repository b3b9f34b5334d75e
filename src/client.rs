use std::{collections::BTreeMap, io::Read as _};

use anyhow::Context as _;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt as _, Full};
use hyper::{Method, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

type UpstreamHttpClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// An upstream call assembled by the controller: the configured API
/// endpoint plus the rewritten request being forwarded.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
    /// Complete path including the configured base and the original query.
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Response body, already gzip-decompressed when the upstream sent it
    /// compressed.
    pub body: String,
}

/// HTTP/HTTPS client adapter for the real API. Bodies arrive fully
/// collected and transparently gunzipped; callers never see transfer
/// encoding.
pub struct UpstreamClient {
    client: UpstreamHttpClient,
}

impl UpstreamClient {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| anyhow::anyhow!("load native TLS root certificates: {err}"))?
            .https_or_http()
            .enable_http1()
            .build();
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }

    pub async fn request(&self, upstream: UpstreamRequest) -> anyhow::Result<UpstreamResponse> {
        let authority = match upstream.port {
            Some(port) => format!("{}:{port}", upstream.hostname),
            None => upstream.hostname.clone(),
        };
        let uri: Uri = format!("{}://{authority}{}", upstream.scheme, upstream.path)
            .parse()
            .with_context(|| format!("build upstream URI for {}", upstream.path))?;

        let method = Method::from_bytes(upstream.method.as_bytes())
            .with_context(|| format!("parse request method {}", upstream.method))?;
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in &upstream.headers {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(Bytes::from(upstream.body)))
            .context("build upstream request")?;

        let response = self
            .client
            .request(request)
            .await
            .context("send upstream request")?;

        let (parts, body) = response.into_parts();
        let headers: BTreeMap<String, String> = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_owned(), value.to_owned()))
            })
            .collect();

        let body_bytes = body
            .collect()
            .await
            .context("read upstream response body")?
            .to_bytes();
        let body_bytes = if is_gzip_encoded(&headers) {
            gunzip(&body_bytes)?
        } else {
            body_bytes.to_vec()
        };

        Ok(UpstreamResponse {
            status: parts.status.as_u16(),
            headers,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
        })
    }
}

fn is_gzip_encoded(headers: &BTreeMap<String, String>) -> bool {
    headers
        .iter()
        .any(|(name, value)| name.eq_ignore_ascii_case("content-encoding") && value.contains("gzip"))
}

fn gunzip(bytes: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .context("decompress gzip upstream body")?;
    Ok(decompressed)
}

fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io::Write as _};

    use flate2::{Compression, write::GzEncoder};

    use super::{gunzip, is_gzip_encoded};

    #[test]
    fn gunzip_round_trips_compressed_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"upstream payload").unwrap();
        let compressed = encoder.finish().unwrap();

        let decompressed = gunzip(&compressed).expect("gunzip should succeed");
        assert_eq!(&decompressed[..], b"upstream payload");
    }

    #[test]
    fn gunzip_rejects_garbage() {
        let err = gunzip(b"definitely not gzip").unwrap_err();
        assert!(
            err.to_string().contains("decompress gzip upstream body"),
            "error: {err}"
        );
    }

    #[test]
    fn gzip_detection_is_case_insensitive_on_header_name() {
        let headers = BTreeMap::from([("Content-Encoding".to_owned(), "gzip".to_owned())]);
        assert!(is_gzip_encoded(&headers));

        let plain = BTreeMap::from([("content-encoding".to_owned(), "identity".to_owned())]);
        assert!(!is_gzip_encoded(&plain));

        assert!(!is_gzip_encoded(&BTreeMap::new()));
    }
}
