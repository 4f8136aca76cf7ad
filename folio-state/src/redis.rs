//! Redis-backed document store.
//!
//! Documents live as RedisJSON values under `portfolio:{session_id}`.
//! Multi-step mutations are Lua scripts wrapping path-addressed JSON
//! commands, loaded once at startup and invoked by SHA handle, so every
//! operation is a single atomic server-side step. Arrays grow through
//! `JSON.ARRAPPEND` and market updates read only `$.holdings`, never the
//! whole document.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{cmd, Client, ErrorKind, RedisError};
use tracing::{debug, info, warn};

use crate::{session_id_from_key, session_key, DocumentStore, StateError, StateResult, KEY_PREFIX};

// KEYS[1] = portfolio:<session_id>
// ARGV[1] = JSON object for current_analysis
// ARGV[2] = JSON-quoted ISO timestamp
// ARGV[3] = TTL in seconds
const BEGIN_ANALYSIS: &str = r#"
local exists = redis.call('JSON.TYPE', KEYS[1], '$')
if not exists or exists[1] == false then return nil end

redis.call('JSON.SET', KEYS[1], '$.current_analysis', ARGV[1])
redis.call('JSON.SET', KEYS[1], '$.last_activity', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return redis.call('JSON.GET', KEYS[1])
"#;

// KEYS[1] = portfolio:<session_id>
// ARGV[1] = JSON of one result record
// ARGV[2] = JSON-quoted ISO timestamp
// ARGV[3] = TTL in seconds
const APPEND_RESULT: &str = r#"
local exists = redis.call('JSON.TYPE', KEYS[1], '$')
if not exists or exists[1] == false then return nil end

redis.call('JSON.ARRAPPEND', KEYS[1], '$.analysis_results', ARGV[1])
redis.call('JSON.SET', KEYS[1], '$.last_activity', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return redis.call('JSON.GET', KEYS[1])
"#;

// Reads only $.holdings, recomputes the total from ARGV[1] prices, writes
// back $.total_value. Tickers without a quoted price contribute nothing.
// KEYS[1] = portfolio:<session_id>
// ARGV[1] = JSON object mapping ticker -> price
// ARGV[2] = JSON-quoted ISO timestamp
// ARGV[3] = TTL in seconds
const APPLY_MARKET_UPDATE: &str = r#"
local raw_holdings = redis.call('JSON.GET', KEYS[1], '$.holdings')
if not raw_holdings then return nil end

local holdings = cjson.decode(raw_holdings)[1]
local prices = cjson.decode(ARGV[1])

local total = 0
for ticker, qty in pairs(holdings) do
    local price = prices[ticker]
    if price then
        total = total + (price * qty)
    end
end

redis.call('JSON.SET', KEYS[1], '$.total_value', tostring(total))
redis.call('JSON.SET', KEYS[1], '$.last_activity', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
return redis.call('JSON.GET', KEYS[1])
"#;

// Transport-level bound on every store command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

struct RegisteredScript {
    name: &'static str,
    source: &'static str,
    sha: String,
}

impl RegisteredScript {
    async fn load(
        conn: &mut ConnectionManager,
        name: &'static str,
        source: &'static str,
    ) -> StateResult<Self> {
        let sha = register(conn, source).await?;
        debug!(target: "folio.state", script = name, %sha, "script registered");
        Ok(Self { name, source, sha })
    }
}

async fn register(conn: &mut ConnectionManager, source: &str) -> StateResult<String> {
    cmd("SCRIPT")
        .arg("LOAD")
        .arg(source)
        .query_async(conn)
        .await
        .map_err(transport)
}

struct ScriptSet {
    begin_analysis: RegisteredScript,
    append_result: RegisteredScript,
    apply_market_update: RegisteredScript,
}

/// Document store backed by Redis with the RedisJSON module.
pub struct RedisStore {
    conn: ConnectionManager,
    ttl_secs: u64,
    scripts: ScriptSet,
}

impl RedisStore {
    /// Connect, build the shared connection, and register all scripts.
    ///
    /// Failure here is fatal for the process: the caller cannot operate
    /// without a store.
    pub async fn connect(url: &str, ttl_secs: u64) -> StateResult<Self> {
        let client = Client::open(url).map_err(transport)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(COMMAND_TIMEOUT)
            .set_response_timeout(COMMAND_TIMEOUT);
        let mut conn = client
            .get_connection_manager_with_config(manager_config)
            .await
            .map_err(transport)?;
        let scripts = ScriptSet {
            begin_analysis: RegisteredScript::load(&mut conn, "begin_analysis", BEGIN_ANALYSIS)
                .await?,
            append_result: RegisteredScript::load(&mut conn, "append_result", APPEND_RESULT)
                .await?,
            apply_market_update: RegisteredScript::load(
                &mut conn,
                "apply_market_update",
                APPLY_MARKET_UPDATE,
            )
            .await?,
        };
        info!(target: "folio.state", "document store connected, scripts registered");
        Ok(Self {
            conn,
            ttl_secs,
            scripts,
        })
    }

    async fn eval(
        conn: &mut ConnectionManager,
        script: &RegisteredScript,
        key: &str,
        args: &[&str],
        ttl_secs: u64,
    ) -> Result<Option<String>, RedisError> {
        let mut invocation = cmd("EVALSHA");
        invocation.arg(&script.sha).arg(1).arg(key);
        for arg in args {
            invocation.arg(arg);
        }
        invocation.arg(ttl_secs).query_async(conn).await
    }

    /// Invoke a script by handle. A server that lost the script (restart,
    /// SCRIPT FLUSH) gets exactly one re-register-and-retry.
    async fn invoke(
        &self,
        script: &RegisteredScript,
        session_id: &str,
        args: &[&str],
    ) -> StateResult<String> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();
        let outcome = match Self::eval(&mut conn, script, &key, args, self.ttl_secs).await {
            Err(err) if err.kind() == ErrorKind::NoScriptError => {
                warn!(
                    target: "folio.state",
                    script = script.name,
                    "script missing on server, re-registering"
                );
                register(&mut conn, script.source).await?;
                Self::eval(&mut conn, script, &key, args, self.ttl_secs)
                    .await
                    .map_err(transport)?
            }
            other => other.map_err(transport)?,
        };
        outcome.ok_or_else(|| StateError::NotFound(session_id.to_string()))
    }

    async fn refresh_ttl(&self, conn: &mut ConnectionManager, key: &str) -> StateResult<()> {
        let _: i64 = cmd("EXPIRE")
            .arg(key)
            .arg(self.ttl_secs)
            .query_async(conn)
            .await
            .map_err(transport)?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn ensure(&self, session_id: &str, initial_json: &str) -> StateResult<String> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();
        let created: Result<Option<String>, RedisError> = cmd("JSON.SET")
            .arg(&key)
            .arg("$")
            .arg(initial_json)
            .arg("NX")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(_) => {}
            // Stale key from a previous run stored as a different type.
            Err(err) if err.code() == Some("WRONGTYPE") => {
                warn!(target: "folio.state", session_id, "replacing stale non-document key");
                let _: i64 = cmd("DEL")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await
                    .map_err(transport)?;
                let _: Option<String> = cmd("JSON.SET")
                    .arg(&key)
                    .arg("$")
                    .arg(initial_json)
                    .query_async(&mut conn)
                    .await
                    .map_err(transport)?;
            }
            Err(err) => return Err(transport(err)),
        }
        self.refresh_ttl(&mut conn, &key).await?;
        let raw: Option<String> = cmd("JSON.GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        raw.ok_or_else(|| StateError::NotFound(session_id.to_string()))
    }

    async fn read(&self, session_id: &str) -> StateResult<String> {
        let key = session_key(session_id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = cmd("JSON.GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        match raw {
            Some(doc) => {
                self.refresh_ttl(&mut conn, &key).await?;
                Ok(doc)
            }
            None => Err(StateError::NotFound(session_id.to_string())),
        }
    }

    async fn begin_analysis(
        &self,
        session_id: &str,
        ticker: &str,
        started_at: &str,
    ) -> StateResult<String> {
        let current = serde_json::json!({ "ticker": ticker, "started_at": started_at }).to_string();
        let activity = json_quote(started_at)?;
        self.invoke(&self.scripts.begin_analysis, session_id, &[&current, &activity])
            .await
    }

    async fn append_result(
        &self,
        session_id: &str,
        result_json: &str,
        last_activity: &str,
    ) -> StateResult<String> {
        let activity = json_quote(last_activity)?;
        self.invoke(
            &self.scripts.append_result,
            session_id,
            &[result_json, &activity],
        )
        .await
    }

    async fn apply_market_update(
        &self,
        session_id: &str,
        prices_json: &str,
        last_activity: &str,
    ) -> StateResult<String> {
        let activity = json_quote(last_activity)?;
        self.invoke(
            &self.scripts.apply_market_update,
            session_id,
            &[prices_json, &activity],
        )
        .await
    }

    async fn list_sessions(&self) -> StateResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{KEY_PREFIX}*");
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();
        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            ids.extend(
                keys.iter()
                    .filter_map(|key| session_id_from_key(key))
                    .map(str::to_string),
            );
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

fn transport(err: RedisError) -> StateError {
    StateError::Transport(err.to_string())
}

fn json_quote(raw: &str) -> StateResult<String> {
    serde_json::to_string(raw).map_err(|err| StateError::Serialization(err.to_string()))
}
