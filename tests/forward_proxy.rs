use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::{
    Method, Request, Response, StatusCode, Uri,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use rusqlite::Connection;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

#[derive(Debug)]
struct SeenRequest {
    uri: Uri,
    headers: hyper::HeaderMap,
    body: Bytes,
}

async fn spawn_origin() -> (SocketAddr, mpsc::Receiver<SeenRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel::<SeenRequest>(8);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let tx = Arc::new(tx);
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = Arc::clone(&tx);
                    async move {
                        let (parts, body) = req.into_parts();
                        let body_bytes = body.collect().await.unwrap().to_bytes();
                        tx.send(SeenRequest {
                            uri: parts.uri,
                            headers: parts.headers,
                            body: body_bytes,
                        })
                        .await
                        .unwrap();

                        let mut res =
                            Response::new(Full::new(Bytes::from_static(b"origin-body")));
                        *res.status_mut() = StatusCode::CREATED;
                        res.headers_mut()
                            .insert("x-origin", HeaderValue::from_static("ok"));
                        Ok::<_, hyper::Error>(res)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, rx)
}

fn config_for(db_path: &Path) -> interceptproxy::config::Config {
    let config_toml = format!(
        r#"
[proxy]
listen = "127.0.0.1:0"

[api]
listen = "127.0.0.1:0"

[storage]
path = "{}"
"#,
        db_path.display()
    );
    interceptproxy::config::Config::from_toml_str(&config_toml).unwrap()
}

async fn proxy_sender(
    proxy_addr: SocketAddr,
) -> hyper::client::conn::http1::SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });
    sender
}

async fn wait_for_row_count(db_path: &Path, table: &str, expected: i64) {
    for _ in 0..100 {
        if let Ok(conn) = Connection::open(db_path) {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table};"), [], |row| {
                    row.get(0)
                })
                .unwrap_or(0);
            if count >= expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("table {table} never reached {expected} rows");
}

#[tokio::test]
async fn forwards_in_origin_form_and_captures_both_sides() {
    let (origin_addr, mut origin_rx) = spawn_origin().await;

    let storage_dir = tempfile::tempdir().unwrap();
    let db_path = storage_dir.path().join("capture.db");
    let proxy = interceptproxy::proxy::serve(&config_for(&db_path))
        .await
        .unwrap();

    let mut sender = proxy_sender(proxy.listen_addr).await;
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{origin_addr}/submit?q=1"))
        .header(header::HOST, origin_addr.to_string())
        .header("proxy-connection", "keep-alive")
        .header("x-end", "kept")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::COOKIE, "sid=abc")
        .body(Full::new(Bytes::from_static(b"user=alice&pw=s3c")))
        .unwrap();

    let res = sender.send_request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(
        res.headers().get("x-origin").unwrap(),
        &HeaderValue::from_static("ok")
    );
    let body_bytes = res.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body_bytes[..], b"origin-body");

    // The origin must see an origin-form target, the request body, and no
    // proxy hop header.
    let seen = origin_rx.recv().await.unwrap();
    assert_eq!(seen.uri.to_string(), "/submit?q=1");
    assert_eq!(
        seen.headers.get(header::HOST).unwrap(),
        &HeaderValue::from_str(&origin_addr.to_string()).unwrap()
    );
    assert_eq!(
        seen.headers.get("x-end").unwrap(),
        &HeaderValue::from_static("kept")
    );
    assert!(seen.headers.get("proxy-connection").is_none());
    assert_eq!(&seen.body[..], b"user=alice&pw=s3c");

    wait_for_row_count(&db_path, "requests", 1).await;
    wait_for_row_count(&db_path, "responses", 1).await;

    let conn = Connection::open(&db_path).unwrap();
    let (scheme, method, path, host, headers_json, cookies_json, get_json, post_json, body): (
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        String,
        String,
    ) = conn
        .query_row(
            "SELECT scheme, method, path, host, headers_json, cookies_json, get_params_json, post_params_json, body FROM requests;",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            },
        )
        .unwrap();
    assert_eq!(scheme, "http");
    assert_eq!(method, "POST");
    assert_eq!(path, "/submit");
    assert_eq!(host, origin_addr.to_string());
    assert!(headers_json.contains("x-end"), "headers: {headers_json}");
    assert!(
        !headers_json.contains("proxy-connection"),
        "headers: {headers_json}"
    );
    assert!(!headers_json.contains("cookie"), "headers: {headers_json}");
    assert_eq!(cookies_json, r#"{"sid":"abc"}"#);
    assert_eq!(get_json, r#"{"q":["1"]}"#);
    assert_eq!(post_json, r#"{"pw":["s3c"],"user":["alice"]}"#);
    assert_eq!(body, "user=alice&pw=s3c");

    let (status_code, status_text, response_body, content_length, compressed): (
        i64,
        String,
        String,
        i64,
        bool,
    ) = conn
        .query_row(
            "SELECT status_code, status_text, body, content_length, compressed FROM responses;",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .unwrap();
    assert_eq!(status_code, 201);
    assert_eq!(status_text, "Created");
    assert_eq!(response_body, "origin-body");
    assert_eq!(content_length, 11);
    assert!(!compressed);

    proxy.shutdown().await;
}

#[tokio::test]
async fn origin_form_requests_fall_back_to_the_host_header() {
    let (origin_addr, mut origin_rx) = spawn_origin().await;

    let storage_dir = tempfile::tempdir().unwrap();
    let db_path = storage_dir.path().join("capture.db");
    let proxy = interceptproxy::proxy::serve(&config_for(&db_path))
        .await
        .unwrap();

    let mut sender = proxy_sender(proxy.listen_addr).await;
    let req = Request::builder()
        .method(Method::GET)
        .uri("/via-host?a=b")
        .header(header::HOST, origin_addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();

    let res = sender.send_request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let seen = origin_rx.recv().await.unwrap();
    assert_eq!(seen.uri.to_string(), "/via-host?a=b");

    proxy.shutdown().await;
}

#[tokio::test]
async fn unreachable_origin_returns_503_with_the_cause() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let storage_dir = tempfile::tempdir().unwrap();
    let db_path = storage_dir.path().join("capture.db");
    let proxy = interceptproxy::proxy::serve(&config_for(&db_path))
        .await
        .unwrap();

    let mut sender = proxy_sender(proxy.listen_addr).await;
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{dead_addr}/gone"))
        .header(header::HOST, dead_addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();

    let res = sender.send_request(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body_bytes = res.into_body().collect().await.unwrap().to_bytes();
    let body_text = String::from_utf8(body_bytes.to_vec()).unwrap();
    assert!(body_text.contains("dial origin"), "body: {body_text}");

    // The failed exchange still captures the request side.
    wait_for_row_count(&db_path, "requests", 1).await;

    proxy.shutdown().await;
}
