//! HTTP client for the blueprint storage service.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;

use super::{BlueprintStore, FetchError, FetchResult, decode_envelope};
use crate::model::{AuthorBlueprints, Blueprint, BlueprintKey, Point};

/// Talks to `<base>/blueprints…` over HTTP.
pub struct HttpStore {
    base: Url,
    client: Client,
}

impl HttpStore {
    pub fn new(base: &str, timeout: Duration) -> FetchResult<Self> {
        let base = Url::parse(base.trim_end_matches('/'))
            .map_err(|e| FetchError::InvalidUrl(format!("{base}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(FetchError::InvalidUrl(base.to_string()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(Self { base, client })
    }

    /// `<base>/blueprints/<segments…>` with every segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> FetchResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push("blueprints")
            .extend(segments);
        Ok(url)
    }

    fn send(&self, request: RequestBuilder) -> FetchResult<String> {
        let response = request
            .send()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        response
            .text()
            .map_err(|e| FetchError::Request(e.to_string()))
    }

    fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> FetchResult<T> {
        let body = self.send(request)?;
        decode_envelope(&body)
    }
}

impl BlueprintStore for HttpStore {
    fn list_by_author(&self, author: &str) -> FetchResult<AuthorBlueprints> {
        let url = self.endpoint(&[author])?;
        log::debug!("[GET] {url}");
        self.fetch(self.client.get(url))
    }

    fn get(&self, key: &BlueprintKey) -> FetchResult<Blueprint> {
        let url = self.endpoint(&[key.author.as_str(), key.name.as_str()])?;
        log::debug!("[GET] {url}");
        self.fetch(self.client.get(url))
    }

    fn create(&self, blueprint: &Blueprint) -> FetchResult<Blueprint> {
        let url = self.endpoint(&[])?;
        log::debug!("[POST] {url}");
        self.fetch(self.client.post(url).json(blueprint))
    }

    fn replace_points(&self, key: &BlueprintKey, points: &[Point]) -> FetchResult<Blueprint> {
        let url = self.endpoint(&[key.author.as_str(), key.name.as_str()])?;
        log::debug!("[PUT] {url} ({} points)", points.len());
        let body = json!({ "author": key.author, "name": key.name, "points": points });
        self.fetch(self.client.put(url).json(&body))
    }

    fn append_point(&self, key: &BlueprintKey, point: Point) -> FetchResult<Blueprint> {
        let url = self.endpoint(&[key.author.as_str(), key.name.as_str(), "points"])?;
        log::debug!("[PUT] {url} {point}");
        self.fetch(self.client.put(url).json(&point))
    }

    fn delete(&self, key: &BlueprintKey) -> FetchResult<()> {
        let url = self.endpoint(&[key.author.as_str(), key.name.as_str()])?;
        log::debug!("[DELETE] {url}");
        self.send(self.client.delete(url)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serve a single canned HTTP response and hand back the raw request.
    fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length || n == 0 {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (base, handle)
    }

    fn store(base: &str) -> HttpStore {
        HttpStore::new(base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let store = store("http://localhost:8080/api/");
        let url = store.endpoint(&["ana maria", "p/1", "points"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/api/blueprints/ana%20maria/p%2F1/points"
        );
        assert_eq!(
            store.endpoint(&[]).unwrap().as_str(),
            "http://localhost:8080/api/blueprints"
        );
    }

    #[test]
    fn test_invalid_base() {
        assert!(matches!(
            HttpStore::new("mailto:someone", Duration::from_secs(1)),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_get_unwraps_envelope() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"data":{"author":"ana","name":"p1","points":[{"x":1,"y":1},{"x":2,"y":2}]}}"#,
        );
        let bp = store(&base).get(&BlueprintKey::new("ana", "p1")).unwrap();
        assert_eq!(bp.points, vec![Point::new(1, 1), Point::new(2, 2)]);
        let request = server.join().unwrap();
        assert!(request.starts_with("GET /blueprints/ana/p1 "));
    }

    #[test]
    fn test_non_success_carries_status() {
        let (base, server) = serve_once("503 Service Unavailable", "{}");
        let result = store(&base).get(&BlueprintKey::new("ana", "p1"));
        assert!(matches!(result, Err(FetchError::Status(503))));
        server.join().unwrap();
    }

    #[test]
    fn test_append_point_sends_bare_point() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"author":"ana","name":"p1","points":[{"x":3,"y":3}]}"#,
        );
        store(&base)
            .append_point(&BlueprintKey::new("ana", "p1"), Point::new(3, 3))
            .unwrap();
        let request = server.join().unwrap();
        assert!(request.starts_with("PUT /blueprints/ana/p1/points "));
        assert!(request.ends_with(r#"{"x":3,"y":3}"#));
    }

    #[test]
    fn test_delete_ignores_empty_body() {
        let (base, server) = serve_once("204 No Content", "");
        store(&base).delete(&BlueprintKey::new("ana", "p1")).unwrap();
        assert!(server.join().unwrap().starts_with("DELETE /blueprints/ana/p1 "));
    }
}
