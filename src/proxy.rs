use std::{convert::Infallible, error::Error as StdError, net::SocketAddr, path::PathBuf, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    http::{
        request::Parts,
        uri::{Authority, Uri},
    },
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};

use crate::{
    api::{ApiState, api_handler},
    capture::{Scheme, capture_request, decode_response},
    config::Config,
    replay::build_replay_client,
    storage::{RequestStore, Storage},
    tls::{
        build_tls_acceptor, ensure_rustls_crypto_provider, insecure_upstream_connector,
        validate_identity,
    },
};

pub type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;

struct ProxyState<S> {
    store: Arc<S>,
    tls_cert: PathBuf,
    tls_key: PathBuf,
}

pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub api_listen_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
    api_shutdown_tx: oneshot::Sender<()>,
    api_join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.api_shutdown_tx.send(());
        let _ = self.join.await;
        let _ = self.api_join.await;
    }
}

pub async fn serve(config: &Config) -> anyhow::Result<ProxyHandle> {
    ensure_rustls_crypto_provider()?;
    if let Err(err) = validate_identity(&config.tls.cert, &config.tls.key) {
        tracing::warn!(
            "TLS identity check failed: {err:#}; CONNECT interception will fail until fixed"
        );
    }

    let store = Arc::new(Storage::from_config(config)?);

    let listener = TcpListener::bind(config.proxy.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind proxy {}: {err}", config.proxy.listen))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get proxy local_addr: {err}"))?;
    let api_listener = TcpListener::bind(config.api.listen)
        .await
        .map_err(|err| anyhow::anyhow!("bind api {}: {err}", config.api.listen))?;
    let api_listen_addr = api_listener
        .local_addr()
        .map_err(|err| anyhow::anyhow!("get api local_addr: {err}"))?;

    let state = Arc::new(ProxyState {
        store: Arc::clone(&store),
        tls_cert: config.tls.cert.clone(),
        tls_key: config.tls.key.clone(),
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| proxy_handler(req, Arc::clone(&state)));
                        // The CONNECT established line must go out without a
                        // Date header, so the plain http1 builder is used here
                        // instead of the auto negotiating one.
                        if let Err(err) = hyper::server::conn::http1::Builder::new()
                            .auto_date_header(false)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            tracing::debug!("proxy connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    let api_state = Arc::new(ApiState {
        store,
        client: build_replay_client()?,
    });
    let (api_shutdown_tx, mut api_shutdown_rx) = oneshot::channel::<()>();
    let api_join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut api_shutdown_rx => break,
                accept = api_listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let io = TokioIo::new(stream);
                    let api_state = Arc::clone(&api_state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            api_handler(req, Arc::clone(&api_state))
                        });
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("api connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        api_listen_addr,
        shutdown_tx,
        join,
        api_shutdown_tx,
        api_join,
    })
}

async fn proxy_handler<S>(
    mut req: Request<Incoming>,
    state: Arc<ProxyState<S>>,
) -> Result<Response<ProxyBody>, Infallible>
where
    S: RequestStore + 'static,
{
    if req.method() == Method::CONNECT {
        let Some(connect_authority) = req.uri().authority().cloned() else {
            return Ok(simple_response(
                StatusCode::BAD_REQUEST,
                "CONNECT request target must include authority",
            ));
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();
        match capture_request(&parts, &Bytes::new(), Scheme::Https) {
            Ok(record) => {
                let store = Arc::clone(&state.store);
                tokio::spawn(async move {
                    if let Err(err) = store.save_request(&record).await {
                        tracing::warn!("persist CONNECT capture failed: {err}");
                    }
                });
            }
            Err(err) => tracing::warn!("capture CONNECT request failed: {err}"),
        }

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(err) = mitm_upgraded_connection(on_upgrade, connect_authority, state).await {
                tracing::debug!("CONNECT MITM session finished: {err}");
            }
        });

        let mut response = Response::new(boxed_full(Bytes::new()));
        *response.status_mut() = StatusCode::OK;
        response
            .extensions_mut()
            .insert(hyper::ext::ReasonPhrase::from_static(
                b"Connection established",
            ));
        return Ok(response);
    }

    let (mut parts, body) = req.into_parts();
    let raw_body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Ok(simple_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &err.to_string(),
            ));
        }
    };

    parts.headers.remove("proxy-connection");
    tracing::debug!(method = %parts.method, uri = %parts.uri, "proxy request");

    match capture_request(&parts, &raw_body, Scheme::Http) {
        Ok(record) => {
            let store = Arc::clone(&state.store);
            tokio::spawn(async move {
                if let Err(err) = store.save_request(&record).await {
                    tracing::warn!("persist captured request failed: {err}");
                }
            });
        }
        Err(err) => tracing::warn!("capture request failed: {err}"),
    }

    let upstream_response = match forward_to_origin(&parts, raw_body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(uri = %parts.uri, "forward to origin failed: {err:#}");
            return Ok(simple_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("{err:#}"),
            ));
        }
    };

    let (response_parts, response_body) = upstream_response.into_parts();
    let raw_response = match response_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Ok(simple_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &err.to_string(),
            ));
        }
    };

    let status = response_parts.status;
    let capture_headers = response_parts.headers.clone();
    let capture_body = raw_response.clone();
    let store = Arc::clone(&state.store);
    tokio::spawn(async move {
        match decode_response(status, &capture_headers, &capture_body) {
            Ok(record) => {
                if let Err(err) = store.save_response(&record).await {
                    tracing::warn!("persist captured response failed: {err}");
                }
            }
            Err(err) => tracing::warn!("capture response failed: {err}"),
        }
    });

    let mut client_response = Response::new(boxed_full(raw_response));
    *client_response.status_mut() = response_parts.status;
    *client_response.headers_mut() = response_parts.headers;
    Ok(client_response)
}

/// One plain TCP connection to the origin per request, single attempt.
async fn forward_to_origin(parts: &Parts, raw_body: Bytes) -> anyhow::Result<Response<Incoming>> {
    let target = forward_target(parts)?;
    let stream = TcpStream::connect(target.as_str())
        .await
        .map_err(|err| anyhow::anyhow!("dial origin {target}: {err}"))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Full<Bytes>>(
        TokioIo::new(stream),
    )
    .await
    .map_err(|err| anyhow::anyhow!("origin handshake with {target}: {err}"))?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!("origin connection error: {err}");
        }
    });

    let mut forward = Request::builder()
        .method(parts.method.clone())
        .uri(origin_form_uri(&parts.uri))
        .body(Full::new(raw_body))
        .map_err(|err| anyhow::anyhow!("build origin request: {err}"))?;
    *forward.headers_mut() = parts.headers.clone();
    forward.headers_mut().remove(header::TRANSFER_ENCODING);
    if let Some(authority) = parts.uri.authority() {
        let host = HeaderValue::from_str(authority.as_str())
            .map_err(|err| anyhow::anyhow!("derive host header from {authority}: {err}"))?;
        forward.headers_mut().insert(header::HOST, host);
    }

    sender
        .send_request(forward)
        .await
        .map_err(|err| anyhow::anyhow!("send request to origin {target}: {err}"))
}

fn origin_form_uri(uri: &Uri) -> Uri {
    match uri.path_and_query() {
        Some(path_and_query) => Uri::from(path_and_query.clone()),
        None => Uri::from_static("/"),
    }
}

fn forward_target(parts: &Parts) -> anyhow::Result<String> {
    if let Some(authority) = parts.uri.authority() {
        return Ok(authority_target(authority, 80));
    }
    let Some(host) = parts.headers.get(header::HOST) else {
        anyhow::bail!("request target has no host");
    };
    let host = host
        .to_str()
        .map_err(|err| anyhow::anyhow!("read host header: {err}"))?;
    let authority = Authority::try_from(host)
        .map_err(|err| anyhow::anyhow!("parse host header `{host}`: {err}"))?;
    Ok(authority_target(&authority, 80))
}

fn connect_tunnel_target(authority: &Authority) -> String {
    authority_target(authority, 443)
}

fn authority_target(authority: &Authority, default_port: u16) -> String {
    if authority.port().is_some() {
        return authority.as_str().to_owned();
    }
    let host = authority.host();
    if host.contains(':') {
        if host.starts_with('[') && host.ends_with(']') {
            format!("{host}:{default_port}")
        } else {
            format!("[{host}]:{default_port}")
        }
    } else {
        format!("{host}:{default_port}")
    }
}

fn upstream_server_name(authority: &Authority) -> anyhow::Result<ServerName<'static>> {
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .map_err(|err| anyhow::anyhow!("parse CONNECT authority host `{host}`: {err}"))
}

async fn mitm_upgraded_connection<S>(
    on_upgrade: hyper::upgrade::OnUpgrade,
    connect_authority: Authority,
    state: Arc<ProxyState<S>>,
) -> anyhow::Result<()>
where
    S: RequestStore + 'static,
{
    let upgraded = on_upgrade
        .await
        .map_err(|err| anyhow::anyhow!("upgrade client CONNECT tunnel: {err}"))?;

    // Per tunnel load so operators can swap the identity files without a
    // restart.
    let acceptor = build_tls_acceptor(&state.tls_cert, &state.tls_key)?;
    let client_tls = acceptor.accept(TokioIo::new(upgraded)).await.map_err(|err| {
        anyhow::anyhow!("TLS handshake with CONNECT client for `{connect_authority}`: {err}")
    })?;
    tracing::debug!(authority = %connect_authority, "CONNECT client handshake complete");

    let tunnel_target = connect_tunnel_target(&connect_authority);
    let upstream_tcp = TcpStream::connect(tunnel_target.as_str())
        .await
        .map_err(|err| anyhow::anyhow!("dial CONNECT upstream {tunnel_target}: {err}"))?;
    let server_name = upstream_server_name(&connect_authority)?;
    let upstream_tls = insecure_upstream_connector()
        .connect(server_name, upstream_tcp)
        .await
        .map_err(|err| {
            anyhow::anyhow!("TLS handshake with CONNECT upstream {tunnel_target}: {err}")
        })?;
    tracing::debug!(target = %tunnel_target, "CONNECT upstream handshake complete");

    relay_tunnel(client_tls, upstream_tls).await
}

/// Decrypted byte relay between the two TLS legs. One copy task per
/// direction; whichever finishes first tears the whole tunnel down.
async fn relay_tunnel<C, U>(client: C, upstream: U) -> anyhow::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    U: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut to_upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });
    let mut to_client = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    });

    let finished = tokio::select! {
        copied = &mut to_upstream => {
            to_client.abort();
            copied
        }
        copied = &mut to_client => {
            to_upstream.abort();
            copied
        }
    };

    match finished {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(err)) => Err(anyhow::anyhow!("copy tunnel bytes: {err}")),
        Err(_) => Ok(()),
    }
}

pub(crate) fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}

pub(crate) fn boxed_incoming(body: Incoming) -> ProxyBody {
    body.map_err(|err| -> Box<dyn StdError + Send + Sync> { Box::new(err) })
        .boxed()
}

pub(crate) fn simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(message.to_owned()));
    *response.status_mut() = status;
    response
}
