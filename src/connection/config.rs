//! Postgres configuration.
use std::env::var;

use crate::{
    common::ByteStr,
    sql::PlaceholderStyle,
};

/// Postgres connection config.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) user: ByteStr,
    pub(crate) pass: ByteStr,
    pub(crate) socket: Option<ByteStr>,
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) dbname: ByteStr,
    pub(crate) options: EngineOptions,
}

impl Config {
    /// Retrieve configuration from environment variable.
    ///
    /// It reads:
    /// - `PGUSER`
    /// - `PGPASS`
    /// - `PGHOST`
    /// - `PGDATABASE`
    /// - `PGPORT`
    ///
    /// Additionally, it also read `DATABASE_URL` to provide missing value from
    /// previous variables before fallback to default value.
    pub fn from_env() -> Config {
        let url = var("DATABASE_URL").ok().and_then(|e| Config::parse_inner(e.into()).ok());

        macro_rules! env {
            ($name:literal,$or:ident,$def:expr) => {
                match (var($name), url.as_ref()) {
                    (Ok(ok), _) => ok.into(),
                    (Err(_), Some(e)) => e.$or.clone(),
                    (Err(_), None) => $def.into(),
                }
            };
        }

        let user = env!("PGUSER", user, "postgres");
        let pass = env!("PGPASS", pass, "");
        let host = env!("PGHOST", host, "localhost");
        let dbname = env!("PGDATABASE", dbname, user.clone());
        let socket = url.as_ref().and_then(|e| e.socket.clone());

        let port = match (var("PGPORT"), url.as_ref()) {
            (Ok(ok), _) => ok.parse().unwrap_or(5432),
            (Err(_), Some(e)) => e.port,
            (Err(_), None) => 5432,
        };

        Self { user, pass, socket, host, port, dbname, options: EngineOptions::default() }
    }

    /// Parse config from url.
    pub fn parse(url: &str) -> Result<Config, ParseError> {
        Self::parse_inner(ByteStr::copy_from_str(url))
    }

    /// Parse config from static string url.
    ///
    /// This is for micro optimization, see [`Bytes::from_static`][1].
    ///
    /// [1]: bytes::Bytes::from_static
    pub fn parse_static(url: &'static str) -> Result<Config, ParseError> {
        Self::parse_inner(ByteStr::from_static(url))
    }

    fn parse_inner(url: ByteStr) -> Result<Self, ParseError> {
        let mut read = url.as_str();

        macro_rules! eat {
            (@ $delim:literal,$id:tt,$len:literal) => {{
                let Some(idx) = read.find($delim) else {
                    return Err(ParseError { reason: concat!(stringify!($id), " missing").into() })
                };
                let capture = &read[..idx];
                read = &read[idx + $len..];
                url.slice_ref(capture)
            }};
            ($delim:literal,$id:tt) => {
                eat!(@ $delim,$id,1)
            };
            ($delim:literal,$id:tt,$len:literal) => {
                eat!(@ $delim,$id,$len)
            };
        }

        let _scheme = eat!("://", user, 3);
        let user = eat!(':', password);
        let pass = eat!('@', host);
        let host = eat!(':', port);
        let port = eat!('/', dbname);
        let dbname = url.slice_ref(read);

        let Ok(port) = port.parse() else {
            return Err(ParseError { reason: "invalid port".into() })
        };

        Ok(Self {
            user,
            pass,
            host,
            port,
            dbname,
            socket: None,
            options: EngineOptions::default(),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut EngineOptions {
        &mut self.options
    }

    /// Replace the engine options wholesale.
    pub fn with_options(mut self, options: EngineOptions) -> Config {
        self.options = options;
        self
    }
}

impl std::str::FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An error when parsing url or option into [`Config`].
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct ParseError {
    pub(crate) reason: std::borrow::Cow<'static, str>,
}

/// Transaction recovery behavior around failing statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoSave {
    /// No savepoints; a failure inside a transaction aborts it.
    #[default]
    Never,
    /// Savepoint only around executions that reuse a server-prepared
    /// statement, where a stale-plan failure is recoverable by retry.
    Conservative,
    /// Savepoint around every execution inside a transaction.
    Always,
}

/// Which protocol face to prefer per query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreferQueryMode {
    /// Always the simple `Query` message, parameters substituted as literals.
    Simple,
    /// The extended Parse/Bind/Execute flow.
    #[default]
    Extended,
    /// Simple for plain statements, extended for parameterized ones.
    ExtendedForPrepared,
    /// Extended, and every statement goes through the query cache.
    ExtendedCacheEverything,
}

/// Engine configuration carried by a connection.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub placeholder_style: PlaceholderStyle,
    /// Executions of one query before promotion to a named server-side
    /// statement. Zero disables promotion. Set through
    /// [`set_prepare_threshold`][EngineOptions::set_prepare_threshold] to get
    /// the negative-means-force-binary rule.
    pub prepare_threshold: u32,
    /// Transfer results in binary format for named statements even below the
    /// promotion threshold.
    pub force_binary: bool,
    pub auto_save: AutoSave,
    pub prefer_query_mode: PreferQueryMode,
    /// Fuse batched rewritable inserts into multi-row VALUES executions.
    pub rewrite_batched_inserts: bool,
    /// Grow the cursor fetch size based on observed row widths.
    pub adaptive_fetch: bool,
    /// Memory budget for one adaptive fetch batch, in bytes.
    pub adaptive_fetch_maximum: usize,
    /// Row-limit per `Execute` for new statements; zero fetches everything.
    pub default_fetch_size: u32,
    /// Process JDBC `{...}` escape sequences in query text.
    pub escape_processing: bool,
    /// Issue each statement in its own transaction. When off the engine
    /// opens a transaction block before the first statement.
    pub autocommit: bool,
    /// Advise the server the transaction is read only when it opens one.
    pub read_only_hint: bool,
    /// Entries kept in the per-connection query cache.
    pub statement_cache_capacity: usize,
    pub application_name: Option<String>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            placeholder_style: PlaceholderStyle::default(),
            prepare_threshold: 5,
            force_binary: false,
            auto_save: AutoSave::default(),
            prefer_query_mode: PreferQueryMode::default(),
            rewrite_batched_inserts: false,
            adaptive_fetch: false,
            adaptive_fetch_maximum: 64 << 20,
            default_fetch_size: 0,
            escape_processing: true,
            autocommit: true,
            read_only_hint: false,
            statement_cache_capacity: 256,
            application_name: None,
        }
    }
}

impl EngineOptions {
    /// A negative threshold forces binary transfer and promotes on first
    /// reuse.
    pub fn set_prepare_threshold(&mut self, threshold: i32) {
        if threshold < 0 {
            self.force_binary = true;
            self.prepare_threshold = 1;
        } else {
            self.prepare_threshold = threshold as u32;
        }
    }
}
