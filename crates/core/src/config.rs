//! Client configuration file
//!
//! Plain `key=value` lines:
//! ```text
//! name=laptop
//! server=sync.example.com:12345
//! user=alice
//! passwd=secret
//! path=/home/alice/box
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ConfigError;

/// Port used when `server` names only a host
pub const DEFAULT_PORT: u16 = 12345;

const NAME_MAX: usize = 32;
const SERVER_MAX: usize = 255;
const USER_MAX: usize = 32;
const PASSWD_MAX: usize = 255;
const PATH_MAX: usize = 4096;

#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Client name, used in logs and as the connection identity
    pub name: String,
    /// `host` or `host:port`
    pub server: String,
    pub user: String,
    pub passwd: String,
    /// Sync root as written; canonicalized at startup
    pub path: PathBuf,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("user", &self.user)
            .field("passwd", &"<redacted>")
            .field("path", &self.path)
            .finish()
    }
}

impl ClientConfig {
    /// Read and parse a config file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or does not parse
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// # Errors
    /// Returns an error for a line without `=`, a missing key or an oversized value
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut name = None;
        let mut server = None;
        let mut user = None;
        let mut passwd = None;
        let mut path = None;

        for (index, raw) in text.split('\n').enumerate() {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::Malformed { line: index + 1 })?;

            let slot = match key {
                "name" => &mut name,
                "server" => &mut server,
                "user" => &mut user,
                "passwd" => &mut passwd,
                "path" => &mut path,
                other => {
                    debug!("ignoring unknown config key `{other}`");
                    continue;
                }
            };
            *slot = Some(value.to_owned());
        }

        Ok(Self {
            name: required("name", name, NAME_MAX)?,
            server: required("server", server, SERVER_MAX)?,
            user: required("user", user, USER_MAX)?,
            passwd: required("passwd", passwd, PASSWD_MAX)?,
            path: PathBuf::from(required("path", path, PATH_MAX)?),
        })
    }

    /// `server` with the default port applied
    #[must_use]
    pub fn server_addr(&self) -> String {
        let server = self.server.as_str();
        if let Some(rest) = server.strip_prefix('[') {
            // Bracketed IPv6, with or without a port
            return if rest.contains("]:") {
                server.to_owned()
            } else {
                format!("{server}:{DEFAULT_PORT}")
            };
        }
        match server.matches(':').count() {
            0 => format!("{server}:{DEFAULT_PORT}"),
            1 => server.to_owned(),
            _ => format!("[{server}]:{DEFAULT_PORT}"),
        }
    }
}

fn required(key: &'static str, value: Option<String>, max: usize) -> Result<String, ConfigError> {
    let value = value.ok_or(ConfigError::Missing(key))?;
    if value.len() > max {
        return Err(ConfigError::TooLong {
            key,
            len: value.len(),
            max,
        });
    }
    Ok(value)
}
