use std::{
    collections::BTreeMap,
    fs,
    future::Future,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, params};

use crate::{
    capture::{CapturedRequest, CapturedResponse, Scheme},
    config::Config,
};

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(i64),
    Internal(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "request with ID {id} not found"),
            Self::Internal(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence capability consumed by the proxy and the query API.
/// Identifiers are assigned here, never by callers.
pub trait RequestStore: Send + Sync {
    fn save_request(
        &self,
        record: &CapturedRequest,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    fn save_response(
        &self,
        record: &CapturedResponse,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_requests(&self) -> impl Future<Output = Result<Vec<CapturedRequest>, StoreError>> + Send;

    fn get_request_by_id(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<CapturedRequest, StoreError>> + Send;
}

#[derive(Debug, Clone)]
pub struct Storage {
    db_path: PathBuf,
}

impl Storage {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(config.storage.path.clone())
    }

    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let storage = Self { db_path };
        storage.init()?;
        Ok(storage)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init(&self) -> anyhow::Result<()> {
        let mut conn = open_connection(&self.db_path)?;
        migrate(&mut conn)?;
        Ok(())
    }
}

impl RequestStore for Storage {
    async fn save_request(&self, record: &CapturedRequest) -> Result<i64, StoreError> {
        let db_path = self.db_path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || save_request_blocking(&db_path, &record))
            .await
            .map_err(|err| StoreError::Internal(format!("join save_request task failed: {err}")))?
            .map_err(internal_error)
    }

    async fn save_response(&self, record: &CapturedResponse) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || save_response_blocking(&db_path, &record))
            .await
            .map_err(|err| StoreError::Internal(format!("join save_response task failed: {err}")))?
            .map_err(internal_error)
    }

    async fn get_requests(&self) -> Result<Vec<CapturedRequest>, StoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || get_requests_blocking(&db_path))
            .await
            .map_err(|err| StoreError::Internal(format!("join get_requests task failed: {err}")))?
            .map_err(internal_error)
    }

    async fn get_request_by_id(&self, id: i64) -> Result<CapturedRequest, StoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || get_request_by_id_blocking(&db_path, id))
            .await
            .map_err(|err| {
                StoreError::Internal(format!("join get_request_by_id task failed: {err}"))
            })?
            .map_err(internal_error)?
            .ok_or(StoreError::NotFound(id))
    }
}

fn internal_error(err: anyhow::Error) -> StoreError {
    StoreError::Internal(format!("{err:#}"))
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("set PRAGMA foreign_keys=ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS requests (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  scheme TEXT NOT NULL,
                  method TEXT NOT NULL,
                  path TEXT NOT NULL,
                  host TEXT NOT NULL,
                  headers_json TEXT NOT NULL,
                  cookies_json TEXT NOT NULL,
                  get_params_json TEXT NOT NULL,
                  post_params_json TEXT NOT NULL,
                  body TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS responses (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  status_code INTEGER NOT NULL,
                  status_text TEXT NOT NULL,
                  headers_json TEXT NOT NULL,
                  body TEXT NOT NULL,
                  content_length INTEGER NOT NULL,
                  compressed INTEGER NOT NULL
                );
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported capture database schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn save_request_blocking(path: &Path, record: &CapturedRequest) -> anyhow::Result<i64> {
    let conn = open_connection(path)?;
    let headers_json =
        serde_json::to_string(&record.headers).context("serialize request headers")?;
    let cookies_json =
        serde_json::to_string(&record.cookies).context("serialize request cookies")?;
    let get_params_json =
        serde_json::to_string(&record.get_params).context("serialize request get params")?;
    let post_params_json =
        serde_json::to_string(&record.post_params).context("serialize request post params")?;

    conn.execute(
        r#"
        INSERT INTO requests (
          scheme,
          method,
          path,
          host,
          headers_json,
          cookies_json,
          get_params_json,
          post_params_json,
          body
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            record.scheme.as_str(),
            record.method,
            record.path,
            record.host,
            headers_json,
            cookies_json,
            get_params_json,
            post_params_json,
            record.body,
        ],
    )
    .context("insert request")?;

    Ok(conn.last_insert_rowid())
}

fn save_response_blocking(path: &Path, record: &CapturedResponse) -> anyhow::Result<()> {
    let conn = open_connection(path)?;
    let headers_json =
        serde_json::to_string(&record.headers).context("serialize response headers")?;
    let content_length =
        i64::try_from(record.content_length).context("content_length exceeds sqlite range")?;

    conn.execute(
        r#"
        INSERT INTO responses (
          status_code,
          status_text,
          headers_json,
          body,
          content_length,
          compressed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            i64::from(record.status_code),
            record.status_text,
            headers_json,
            record.body,
            content_length,
            record.compressed,
        ],
    )
    .context("insert response")?;

    Ok(())
}

fn get_requests_blocking(path: &Path) -> anyhow::Result<Vec<CapturedRequest>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT scheme, method, path, host, headers_json, cookies_json,
                   get_params_json, post_params_json, body
            FROM requests
            ORDER BY id ASC
            "#,
        )
        .context("prepare select requests")?;

    let mut rows = stmt.query([]).context("query requests")?;
    let mut requests = Vec::new();
    while let Some(row) = rows.next().context("iterate requests")? {
        requests.push(deserialize_request_at(row, 0)?);
    }
    Ok(requests)
}

fn get_request_by_id_blocking(path: &Path, id: i64) -> anyhow::Result<Option<CapturedRequest>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT scheme, method, path, host, headers_json, cookies_json,
                   get_params_json, post_params_json, body
            FROM requests
            WHERE id = ?1
            "#,
        )
        .context("prepare select request by id")?;

    let mut rows = stmt.query(params![id]).context("query request by id")?;
    let Some(row) = rows.next().context("read request row")? else {
        return Ok(None);
    };
    Ok(Some(deserialize_request_at(row, 0)?))
}

fn deserialize_request_at(row: &rusqlite::Row<'_>, offset: usize) -> anyhow::Result<CapturedRequest> {
    let scheme = row.get::<_, String>(offset).context("deserialize scheme")?;
    let method = row
        .get::<_, String>(offset + 1)
        .context("deserialize method")?;
    let path = row.get::<_, String>(offset + 2).context("deserialize path")?;
    let host = row.get::<_, String>(offset + 3).context("deserialize host")?;
    let headers_json = row
        .get::<_, String>(offset + 4)
        .context("deserialize headers_json")?;
    let cookies_json = row
        .get::<_, String>(offset + 5)
        .context("deserialize cookies_json")?;
    let get_params_json = row
        .get::<_, String>(offset + 6)
        .context("deserialize get_params_json")?;
    let post_params_json = row
        .get::<_, String>(offset + 7)
        .context("deserialize post_params_json")?;
    let body = row.get::<_, String>(offset + 8).context("deserialize body")?;

    let scheme = scheme
        .parse::<Scheme>()
        .map_err(|err| anyhow::anyhow!("deserialize scheme: {err}"))?;
    let headers: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&headers_json).context("deserialize request headers")?;
    let cookies: BTreeMap<String, String> =
        serde_json::from_str(&cookies_json).context("deserialize request cookies")?;
    let get_params: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&get_params_json).context("deserialize request get params")?;
    let post_params: BTreeMap<String, Vec<String>> =
        serde_json::from_str(&post_params_json).context("deserialize request post params")?;

    Ok(CapturedRequest {
        scheme,
        method,
        path,
        host,
        headers,
        cookies,
        get_params,
        post_params,
        body,
    })
}
