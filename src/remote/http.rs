//! SoliDB-backed remote store.
//!
//! Reads and writes go through the document REST API; queries are compiled
//! to SDBQL and run through the cursor API, following `has_more` pages. The
//! backend has no push channel for arbitrary queries, so live listeners poll
//! and diff.

use super::{
    ListenCallback, ListenEvent, ListenerHandle, NetworkControl, RemoteError, RemoteStore,
};
use crate::model::{ChangeBatch, Direction, Document, FilterOp, Query};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct HttpInner {
    base_url: String,
    database: String,
    api_key: RwLock<Option<String>>,
    client: reqwest::Client,
    enabled: AtomicBool,
}

#[derive(Clone)]
pub struct HttpRemote {
    inner: Arc<HttpInner>,
    poll_interval: Duration,
}

impl HttpRemote {
    pub fn new(base_url: &str, database: &str) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| RemoteError::new("internal", format!("HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(HttpInner {
                base_url: base_url.trim_end_matches('/').to_string(),
                database: database.to_string(),
                api_key: RwLock::new(None),
                client,
                enabled: AtomicBool::new(true),
            }),
            poll_interval: Duration::from_secs(2),
        })
    }

    /// Applies to every clone of this remote, including running listeners.
    pub fn with_api_key(self, api_key: &str) -> Self {
        *self.inner.api_key.write() = Some(api_key.to_string());
        self
    }

    /// Clamped to [`MIN_POLL_INTERVAL`].
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    fn attach_listener<F, Fut>(&self, fetch: F, callback: ListenCallback) -> Result<ListenerHandle, RemoteError>
    where
        F: Fn(Arc<HttpInner>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<Document>, RemoteError>> + Send,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RemoteError::new("failed-precondition", "listeners need a tokio runtime")
        })?;

        let inner = self.inner.clone();
        let interval = self.poll_interval;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last: Option<Vec<Document>> = None;

            loop {
                ticker.tick().await;
                if !inner.enabled.load(Ordering::SeqCst) {
                    continue;
                }

                match fetch(inner.clone()).await {
                    Ok(current) => {
                        let batch = match &last {
                            None => ChangeBatch::initial(current),
                            Some(previous) => ChangeBatch::between(previous, current),
                        };
                        if last.is_some() && batch.is_empty() {
                            continue;
                        }
                        last = Some(batch.documents.clone());
                        callback(ListenEvent::Changes(batch));
                    }
                    Err(e) => {
                        trace!("Listener poll failed: {}", e);
                        callback(ListenEvent::Error(e));
                    }
                }
            }
        });

        Ok(ListenerHandle::new(move || task.abort()))
    }
}

impl HttpInner {
    fn ensure_enabled(&self) -> Result<(), RemoteError> {
        if self.enabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::unavailable("network disabled"))
        }
    }

    fn document_path(&self, collection: &str, key: Option<&str>) -> String {
        match key {
            Some(key) => format!(
                "/_api/database/{}/document/{}/{}",
                self.database, collection, key
            ),
            None => format!("/_api/database/{}/document/{}", self.database, collection),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        self.ensure_enabled()?;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method.clone(), &url);
        if let Some(key) = self.api_key.read().as_deref() {
            request = request.header("X-API-Key", key);
        }
        if let Some(b) = body {
            request = request.json(b);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(map_status(status.as_u16(), &format!("{} {}: {}", method, path, error_text)));
        }

        let text = response.text().await.map_err(map_transport_error)?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| RemoteError::new("internal", format!("Failed to parse response: {}", e)))
    }

    async fn run_query(&self, query: &Query) -> Result<Vec<Document>, RemoteError> {
        let (sdbql, bind_vars) = compile_query(query)?;
        let payload = json!({
            "query": sdbql,
            "bind_vars": bind_vars,
        });
        let path = format!("/_api/database/{}/cursor", self.database);
        let mut response = self
            .request(reqwest::Method::POST, &path, Some(&payload))
            .await?;

        let mut documents = Vec::new();
        loop {
            let page = CursorPage::parse(response)?;
            for row in page.result {
                documents.push(from_remote(row)?);
            }
            match page.next {
                Some(cursor_id) => {
                    trace!("Fetching next batch of cursor {}", cursor_id);
                    response = self
                        .request(
                            reqwest::Method::PUT,
                            &format!("/_api/cursor/{}", cursor_id),
                            None,
                        )
                        .await?;
                }
                None => break,
            }
        }
        Ok(documents)
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Document>, RemoteError> {
        let path = self.document_path(collection, Some(id));
        match self.request(reqwest::Method::GET, &path, None).await {
            Ok(value) => from_remote(value).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// One batch of a cursor response.
#[derive(Debug)]
struct CursorPage {
    result: Vec<Value>,
    next: Option<String>,
}

impl CursorPage {
    fn parse(response: Value) -> Result<Self, RemoteError> {
        let Value::Object(mut body) = response else {
            return Err(RemoteError::new("internal", "cursor response is not an object"));
        };
        let result = match body.remove("result") {
            Some(Value::Array(rows)) => rows,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(RemoteError::new("internal", "cursor result is not an array")),
        };
        let has_more = body
            .get("has_more")
            .or_else(|| body.get("hasMore"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let next = if has_more {
            match body.get("id").and_then(Value::as_str) {
                Some(id) => Some(id.to_string()),
                None => {
                    return Err(RemoteError::new(
                        "internal",
                        "cursor has more results but no id",
                    ))
                }
            }
        } else {
            None
        };
        Ok(Self { result, next })
    }
}

fn map_transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::new("deadline-exceeded", format!("HTTP request timed out: {}", e))
    } else if e.is_connect() {
        RemoteError::unavailable(format!("HTTP connection failed: {}", e))
    } else {
        RemoteError::unavailable(format!("HTTP request failed: {}", e))
    }
}

fn map_status(status: u16, detail: &str) -> RemoteError {
    let code = match status {
        400 => "invalid-argument",
        401 => "unauthenticated",
        403 => "permission-denied",
        404 => "not-found",
        409 => "already-exists",
        502..=504 => "unavailable",
        _ => "internal",
    };
    RemoteError::new(code, format!("HTTP {} {}", status, detail))
}

/// Backend document to [`Document`]: `_key` becomes the id, system fields go.
fn from_remote(value: Value) -> Result<Document, RemoteError> {
    let Value::Object(mut fields) = value else {
        return Err(RemoteError::new("internal", "document is not an object"));
    };
    let id = match fields.remove("_key") {
        Some(Value::String(key)) => key,
        _ => return Err(RemoteError::new("internal", "document has no _key")),
    };
    fields.remove("_id");
    fields.remove("_rev");
    fields.remove("id");
    Ok(Document::new(id, fields))
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

fn field_ref(field: &str) -> Result<String, RemoteError> {
    if field == "id" {
        return Ok("doc._key".to_string());
    }
    if !is_identifier(field) {
        return Err(RemoteError::new(
            "invalid-argument",
            format!("unsupported field name '{}'", field),
        ));
    }
    Ok(format!("doc.{}", field))
}

/// Compile a [`Query`] to SDBQL with positional bind variables.
fn compile_query(query: &Query) -> Result<(String, Map<String, Value>), RemoteError> {
    if !is_identifier(&query.collection) || query.collection.contains('.') {
        return Err(RemoteError::new(
            "invalid-argument",
            format!("unsupported collection name '{}'", query.collection),
        ));
    }

    let mut sdbql = format!("FOR doc IN {}", query.collection);
    let mut bind_vars = Map::new();

    for (i, filter) in query.filters.iter().enumerate() {
        let var = format!("v{}", i);
        let field = field_ref(&filter.field)?;
        let clause = match filter.op {
            FilterOp::In => format!("{} IN @{}", field, var),
            FilterOp::ArrayContains => format!("@{} IN {}", var, field),
            op => format!("{} {} @{}", field, op.as_str(), var),
        };
        sdbql.push_str(&format!(" FILTER {}", clause));
        bind_vars.insert(var, filter.value.clone());
    }

    if !query.order_by.is_empty() {
        let keys = query
            .order_by
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                field_ref(&o.field).map(|f| format!("{} {}", f, dir))
            })
            .collect::<Result<Vec<_>, _>>()?;
        sdbql.push_str(&format!(" SORT {}", keys.join(", ")));
    }

    if let Some(limit) = query.limit {
        sdbql.push_str(&format!(" LIMIT {}", limit));
    }
    sdbql.push_str(" RETURN doc");

    Ok((sdbql, bind_vars))
}

#[async_trait]
impl NetworkControl for HttpRemote {
    async fn enable_network(&self) -> Result<(), RemoteError> {
        self.inner.enabled.store(true, Ordering::SeqCst);
        debug!("Remote network enabled");
        Ok(())
    }

    async fn disable_network(&self) -> Result<(), RemoteError> {
        self.inner.enabled.store(false, Ordering::SeqCst);
        debug!("Remote network disabled");
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn query(&self, query: &Query) -> Result<Vec<Document>, RemoteError> {
        self.inner.run_query(query).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, RemoteError> {
        self.inner.fetch(collection, id).await
    }

    async fn create(
        &self,
        collection: &str,
        fields: Map<String, Value>,
    ) -> Result<String, RemoteError> {
        let path = self.inner.document_path(collection, None);
        let response = self
            .inner
            .request(reqwest::Method::POST, &path, Some(&Value::Object(fields)))
            .await?;
        response
            .get("_key")
            .and_then(|k| k.as_str())
            .map(|k| k.to_string())
            .ok_or_else(|| RemoteError::new("internal", "No _key in insert response"))
    }

    /// Upserts through `?upsert=true`. The backend merges into an existing
    /// document, so fields missing from `fields` are kept.
    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        let path = format!("{}?upsert=true", self.inner.document_path(collection, Some(id)));
        self.inner
            .request(reqwest::Method::PUT, &path, Some(&Value::Object(fields)))
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<(), RemoteError> {
        let path = self.inner.document_path(collection, Some(id));
        self.inner
            .request(reqwest::Method::PUT, &path, Some(&Value::Object(fields)))
            .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), RemoteError> {
        let path = self.inner.document_path(collection, Some(id));
        self.inner
            .request(reqwest::Method::DELETE, &path, None)
            .await?;
        Ok(())
    }

    fn listen(
        &self,
        query: &Query,
        callback: ListenCallback,
    ) -> Result<ListenerHandle, RemoteError> {
        compile_query(query)?;
        let query = query.clone();
        self.attach_listener(
            move |inner| {
                let query = query.clone();
                async move { inner.run_query(&query).await }
            },
            callback,
        )
    }

    fn listen_document(
        &self,
        collection: &str,
        id: &str,
        callback: ListenCallback,
    ) -> Result<ListenerHandle, RemoteError> {
        let collection = collection.to_string();
        let id = id.to_string();
        self.attach_listener(
            move |inner| {
                let collection = collection.clone();
                let id = id.clone();
                async move {
                    Ok(inner
                        .fetch(&collection, &id)
                        .await?
                        .into_iter()
                        .collect())
                }
            },
            callback,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compile_query() {
        let query = Query::collection("trips")
            .where_eq("vehicleId", json!("truck-7"))
            .filter("distanceKm", FilterOp::Gt, json!(10))
            .order_by("startedAt", Direction::Desc)
            .limit(20);

        let (sdbql, bind_vars) = compile_query(&query).unwrap();
        assert_eq!(
            sdbql,
            "FOR doc IN trips FILTER doc.vehicleId == @v0 FILTER doc.distanceKm > @v1 \
             SORT doc.startedAt DESC LIMIT 20 RETURN doc"
        );
        assert_eq!(bind_vars["v0"], "truck-7");
        assert_eq!(bind_vars["v1"], 10);
    }

    #[test]
    fn test_compile_membership_filters() {
        let query = Query::collection("trips")
            .filter("status", FilterOp::In, json!(["active", "planned"]))
            .filter("tags", FilterOp::ArrayContains, json!("night"))
            .where_eq("id", json!("t1"));

        let (sdbql, _) = compile_query(&query).unwrap();
        assert!(sdbql.contains("FILTER doc.status IN @v0"));
        assert!(sdbql.contains("FILTER @v1 IN doc.tags"));
        assert!(sdbql.contains("FILTER doc._key == @v2"));
    }

    #[test]
    fn test_compile_rejects_injection() {
        assert!(compile_query(&Query::collection("trips REMOVE doc")).is_err());
        let bad_field = Query::collection("trips").where_eq("a == 1 OR", json!(1));
        assert!(compile_query(&bad_field).is_err());
    }

    #[test]
    fn test_from_remote_strips_system_fields() {
        let doc = from_remote(json!({
            "_key": "t1",
            "_id": "trips/t1",
            "_rev": "3",
            "vehicleId": "truck-7"
        }))
        .unwrap();

        assert_eq!(doc.id, "t1");
        assert_eq!(doc.fields.len(), 1);
        assert!(from_remote(json!({"vehicleId": "x"})).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status(404, "").code, "not-found");
        assert_eq!(map_status(401, "").code, "unauthenticated");
        assert_eq!(map_status(403, "").code, "permission-denied");
        assert_eq!(map_status(503, "").code, "unavailable");
        assert_eq!(map_status(500, "").code, "internal");
    }

    struct Captured {
        method: String,
        path: String,
        headers: Vec<(String, String)>,
        body: Option<Value>,
    }

    impl Captured {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> Captured {
        use tokio::io::AsyncReadExt;

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let head_end = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next().unwrap().split(' ');
        let method = request_line.next().unwrap().to_string();
        let path = request_line.next().unwrap().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        let length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse::<usize>().unwrap())
            .unwrap_or(0);
        while buf.len() < head_end + length {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before body");
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = (length > 0)
            .then(|| serde_json::from_slice(&buf[head_end..head_end + length]).unwrap());

        Captured {
            method,
            path,
            headers,
            body,
        }
    }

    /// Answers one connection per reply and hands back what was received.
    async fn capture_server(
        replies: Vec<Value>,
    ) -> (String, tokio::task::JoinHandle<Vec<Captured>>) {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut captured = Vec::new();
            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                captured.push(read_request(&mut stream).await);
                let body = reply.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            captured
        });

        (base_url, server)
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_update_sends_fields_as_body() {
        let (url, server) = capture_server(vec![json!({"_key": "t1"})]).await;
        let remote = HttpRemote::new(&url, "fleet").unwrap();

        remote
            .update("trips", "t1", fields(json!({"status": "done"})))
            .await
            .unwrap();

        let requests = server.await.unwrap();
        assert_eq!(requests[0].method, "PUT");
        assert_eq!(requests[0].path, "/_api/database/fleet/document/trips/t1");
        assert_eq!(requests[0].body, Some(json!({"status": "done"})));
    }

    #[tokio::test]
    async fn test_set_upserts_in_one_request() {
        let (url, server) = capture_server(vec![json!({"_key": "t9"})]).await;
        let remote = HttpRemote::new(&url, "fleet").unwrap();

        remote
            .set("trips", "t9", fields(json!({"vehicleId": "v1"})))
            .await
            .unwrap();

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "PUT");
        assert_eq!(
            requests[0].path,
            "/_api/database/fleet/document/trips/t9?upsert=true"
        );
        assert_eq!(requests[0].body, Some(json!({"vehicleId": "v1"})));
    }

    #[tokio::test]
    async fn test_query_uses_cursor_api() {
        let (url, server) = capture_server(vec![json!({
            "result": [{"_key": "t1", "_id": "trips/t1", "status": "active"}],
            "count": 1,
            "has_more": false
        })])
        .await;
        let remote = HttpRemote::new(&url, "fleet").unwrap();

        let docs = remote
            .query(&Query::collection("trips").where_eq("status", json!("active")))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "t1");

        let requests = server.await.unwrap();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/_api/database/fleet/cursor");
        assert_eq!(
            requests[0].body,
            Some(json!({
                "query": "FOR doc IN trips FILTER doc.status == @v0 RETURN doc",
                "bind_vars": {"v0": "active"}
            }))
        );
    }

    #[tokio::test]
    async fn test_query_follows_cursor_pages() {
        let (url, server) = capture_server(vec![
            json!({"result": [{"_key": "t1"}], "has_more": true, "id": "c42"}),
            json!({"result": [{"_key": "t2"}], "has_more": true, "id": "c42"}),
            json!({"result": [{"_key": "t3"}], "has_more": false}),
        ])
        .await;
        let remote = HttpRemote::new(&url, "fleet").unwrap();

        let docs = remote.query(&Query::collection("trips")).await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);

        let requests = server.await.unwrap();
        assert_eq!(requests[1].method, "PUT");
        assert_eq!(requests[1].path, "/_api/cursor/c42");
        assert_eq!(requests[2].path, "/_api/cursor/c42");
    }

    #[test]
    fn test_cursor_page_without_id_is_an_error() {
        let err = CursorPage::parse(json!({"result": [], "hasMore": true})).unwrap_err();
        assert_eq!(err.code, "internal");
        assert!(CursorPage::parse(json!({})).unwrap().next.is_none());
    }

    #[tokio::test]
    async fn test_api_key_reaches_shared_clones() {
        let (url, server) = capture_server(vec![json!({"_key": "t1"})]).await;
        let remote = HttpRemote::new(&url, "fleet").unwrap();
        let shared = remote.clone();
        let _remote = remote.with_api_key("secret");

        shared.get("trips", "t1").await.unwrap();

        let requests = server.await.unwrap();
        assert_eq!(requests[0].header("x-api-key"), Some("secret"));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let remote = HttpRemote::new("http://127.0.0.1:1", "fleet")
            .unwrap()
            .with_poll_interval(Duration::ZERO);
        assert_eq!(remote.poll_interval, MIN_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn test_disabled_network_short_circuits() {
        let remote = HttpRemote::new("http://127.0.0.1:1", "fleet").unwrap();
        remote.disable_network().await.unwrap();

        let err = remote.get("trips", "t1").await.unwrap_err();
        assert_eq!(err.code, "unavailable");
        assert_eq!(err.message, "network disabled");
    }
}
