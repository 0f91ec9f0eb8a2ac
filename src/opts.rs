//! Connection options.

use no_panic::no_panic;
use url::Url;

use crate::error::Error;

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Try SSL, fall back to unencrypted if not supported
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
}

/// Connection options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name to use.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// Additional connection parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,

    /// When connected via TCP to loopback, upgrade to Unix socket for better performance.
    ///
    /// Default: `true`
    pub prefer_unix_socket: bool,

    /// Maximum number of idle connections in the pool.
    ///
    /// Default: `100`
    pub pool_max_idle_conn: usize,

    /// Maximum number of concurrent connections (None = unlimited).
    ///
    /// Default: `None`
    pub pool_max_concurrency: Option<usize>,
}

impl Default for Opts {
    #[cfg_attr(not(test), no_panic)]
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Prefer,
            params: Vec::new(),
            prefer_unix_socket: true,
            pool_max_idle_conn: 100,
            pool_max_concurrency: None,
        }
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?param1=value1&param2=value2&..]`
    ///
    /// Supported query parameters:
    /// - `sslmode`: disable, prefer, require
    /// - `application_name`: application name
    /// - `prefer_unix_socket`: true/True/1/yes/on or false/False/0/no/off
    /// - `pool_max_idle_conn`: maximum idle connections (positive integer)
    /// - `pool_max_concurrency`: maximum concurrent connections (positive integer)
    #[cfg_attr(not(test), no_panic)]
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "pg"].contains(&url.scheme()) {
            return Err(Error::InvalidUsage(format!(
                "Invalid scheme: expected 'postgres://' or 'pg://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    opts.ssl_mode = match value.as_ref() {
                        "disable" => SslMode::Disable,
                        "prefer" => SslMode::Prefer,
                        "require" => SslMode::Require,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {}",
                                value
                            )));
                        }
                    };
                }
                "application_name" => {
                    opts.application_name = Some(value.to_string());
                }
                "prefer_unix_socket" => {
                    opts.prefer_unix_socket = match value.as_ref() {
                        "true" | "True" | "1" | "yes" | "on" => true,
                        "false" | "False" | "0" | "no" | "off" => false,
                        _ => {
                            return Err(Error::InvalidUsage(format!(
                                "Invalid prefer_unix_socket: {}",
                                value
                            )));
                        }
                    };
                }
                "pool_max_idle_conn" => {
                    opts.pool_max_idle_conn = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid pool_max_idle_conn: {}", value))
                    })?;
                }
                "pool_max_concurrency" => {
                    opts.pool_max_concurrency = Some(value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("Invalid pool_max_concurrency: {}", value))
                    })?);
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection string.
    ///
    /// Accepts a standard `postgres://`/`pg://` URL (delegated to
    /// `TryFrom<&Url>`), or the alternate grammar `[alias=]scheme://...`
    /// / `scheme://unix:/path/to/socket[database]`: a leading `alias=`
    /// label before the scheme is stripped (it names a connection
    /// profile; `Opts` itself has no use for it), and a `unix:` host
    /// routes into `socket`/`prefer_unix_socket` instead of `host`/`port`.
    #[cfg_attr(not(test), no_panic)]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let s = strip_alias(s);

        if let Some(opts) = parse_unix_socket_form(s)? {
            return Ok(opts);
        }

        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}

/// Strip a leading `alias=` label: anything before the first `=` that
/// itself appears before the scheme separator `://`.
fn strip_alias(s: &str) -> &str {
    let Some((scheme_part, _)) = s.split_once("://") else {
        return s;
    };
    if scheme_part.split_once('=').is_none() {
        return s;
    }
    match s.split_once('=') {
        Some((_, rest)) => rest,
        None => s,
    }
}

/// Parse `scheme://unix:/path/to/socket[database]`. Returns `Ok(None)` if
/// `s` isn't in this form (the caller falls back to standard URL parsing).
fn parse_unix_socket_form(s: &str) -> Result<Option<Opts>, Error> {
    let Some((scheme, rest)) = s.split_once("://") else {
        return Ok(None);
    };
    if !["postgres", "pg"].contains(&scheme) {
        return Ok(None);
    }
    let Some(path_and_db) = rest.strip_prefix("unix:") else {
        return Ok(None);
    };

    let (socket_path, database) = match path_and_db.split_once('[') {
        Some((path, after)) => match after.strip_suffix(']') {
            Some(db) => (path, Some(db.to_string())),
            None => {
                return Err(Error::InvalidUsage(
                    "unterminated database name in connection string".into(),
                ));
            }
        },
        None => (path_and_db, None),
    };

    if socket_path.is_empty() {
        return Err(Error::InvalidUsage(
            "missing unix socket path in connection string".into(),
        ));
    }

    Ok(Some(Opts {
        socket: Some(socket_path.to_string()),
        prefer_unix_socket: true,
        database,
        ..Opts::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_url_still_parses() {
        let opts = Opts::try_from("postgres://user:pw@localhost:5433/mydb").unwrap();
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.port, 5433);
        assert_eq!(opts.user, "user");
        assert_eq!(opts.password.as_deref(), Some("pw"));
        assert_eq!(opts.database.as_deref(), Some("mydb"));
    }

    #[test]
    fn alias_prefix_is_stripped() {
        let opts = Opts::try_from("primary=postgres://user@localhost:5432/mydb").unwrap();
        assert_eq!(opts.host, "localhost");
        assert_eq!(opts.user, "user");
        assert_eq!(opts.database.as_deref(), Some("mydb"));
    }

    #[test]
    fn unix_socket_form_routes_into_socket_field() {
        let opts = Opts::try_from("postgres://unix:/var/run/postgresql/.s.PGSQL.5432").unwrap();
        assert_eq!(opts.socket.as_deref(), Some("/var/run/postgresql/.s.PGSQL.5432"));
        assert!(opts.prefer_unix_socket);
        assert_eq!(opts.database, None);
    }

    #[test]
    fn unix_socket_form_with_database() {
        let opts =
            Opts::try_from("pg://unix:/tmp/.s.PGSQL.5432[mydb]").unwrap();
        assert_eq!(opts.socket.as_deref(), Some("/tmp/.s.PGSQL.5432"));
        assert_eq!(opts.database.as_deref(), Some("mydb"));
    }

    #[test]
    fn alias_and_unix_socket_form_combine() {
        let opts = Opts::try_from("primary=pg://unix:/tmp/.s.PGSQL.5432[mydb]").unwrap();
        assert_eq!(opts.socket.as_deref(), Some("/tmp/.s.PGSQL.5432"));
        assert_eq!(opts.database.as_deref(), Some("mydb"));
    }

    #[test]
    fn unix_socket_form_rejects_empty_path() {
        assert!(Opts::try_from("postgres://unix:").is_err());
    }
}
