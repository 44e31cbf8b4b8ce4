//! Session configuration.
//!
//! A [`SessionConfig`] is finished and immutable once a session holds it.
//! It can be built in code or deserialized (e.g. from JSON) with serde:
//!
//! ```json
//! { "user": "app", "database": "shop", "host": "db", "port": 5432,
//!   "isolation": "SERIALIZABLE", "identity_mapper": true,
//!   "settings": { "datestyle": "ISO, DMY" } }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ConnectionError, Result};

// ============================================================================
// Isolation level
// ============================================================================

/// Isolation level requested by `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    #[serde(rename = "READ COMMITTED")]
    ReadCommitted,
    #[serde(rename = "REPEATABLE READ")]
    RepeatableRead,
    #[serde(rename = "SERIALIZABLE")]
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        [
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable,
        ]
        .into_iter()
        .find(|level| level.as_sql().eq_ignore_ascii_case(&normalized))
        .ok_or_else(|| {
            ConnectionError::Configuration(format!(
                "isolation must be one of READ COMMITTED, REPEATABLE READ, SERIALIZABLE; got '{}'",
                s
            ))
        })
    }
}

// ============================================================================
// Identity mapper setting
// ============================================================================

/// `identity_mapper` key: `false`, `true` or the name of a registered mapper.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdentityMapperSetting {
    #[default]
    Disabled,
    /// The built-in [`SmartIdentityMapper`](crate::identity::SmartIdentityMapper).
    Default,
    /// A mapper registered under this name in [`IdentityMappers`](crate::identity::IdentityMappers).
    Named(String),
}

impl<'de> Deserialize<'de> for IdentityMapperSetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Name(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => IdentityMapperSetting::Disabled,
            Raw::Flag(true) => IdentityMapperSetting::Default,
            Raw::Name(name) => IdentityMapperSetting::Named(name),
        })
    }
}

// ============================================================================
// Session configuration
// ============================================================================

/// Parameters a session is built from.
#[derive(Clone, Deserialize)]
pub struct SessionConfig {
    user: String,
    database: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    pass: Option<String>,
    #[serde(default)]
    isolation: IsolationLevel,
    #[serde(default)]
    identity_mapper: IdentityMapperSetting,
    /// Session settings applied with `SET` right after connecting.
    #[serde(default)]
    settings: BTreeMap<String, String>,
}

impl SessionConfig {
    pub fn new(user: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            database: database.into(),
            host: None,
            port: None,
            pass: None,
            isolation: IsolationLevel::default(),
            identity_mapper: IdentityMapperSetting::default(),
            settings: BTreeMap::new(),
        }
    }

    /// Parse a JSON document with the keys above.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConnectionError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn password(mut self, pass: impl Into<String>) -> Self {
        self.pass = Some(pass.into());
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn identity_mapper(mut self, setting: IdentityMapperSetting) -> Self {
        self.identity_mapper = setting;
        self
    }

    /// Add a session setting, e.g. `("datestyle", "ISO, DMY")`.
    pub fn setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(ConnectionError::Configuration("user must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(ConnectionError::Configuration("database must not be empty".to_string()));
        }
        if let Some(key) = self.settings.keys().find(|k| !is_setting_name(k)) {
            return Err(ConnectionError::Configuration(format!(
                "invalid setting name '{}'",
                key
            )));
        }
        Ok(())
    }

    pub fn user_name(&self) -> &str {
        &self.user
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn identity_mapper_setting(&self) -> &IdentityMapperSetting {
        &self.identity_mapper
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    /// Where to connect. Empty host or password strings count as absent.
    pub fn target(&self) -> ConnectTarget {
        let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());
        ConnectTarget {
            user: self.user.clone(),
            database: self.database.clone(),
            host: non_empty(&self.host),
            port: self.port,
            password: non_empty(&self.pass),
        }
    }

    /// The batched `SET key = "value";...` statement, or `None` without settings.
    pub fn settings_sql(&self) -> Option<String> {
        if self.settings.is_empty() {
            return None;
        }
        let sql = self
            .settings
            .iter()
            .map(|(key, value)| format!("SET {} = \"{}\";", key, value.replace('"', "\"\"")))
            .collect();
        Some(sql)
    }
}

/// Setting names are plain or dotted identifiers (`search_path`, `myapp.tenant`).
fn is_setting_name(key: &str) -> bool {
    !key.is_empty()
        && key
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

// ============================================================================
// Connect target
// ============================================================================

/// Connection parameters handed to a [`Driver`](crate::driver::Driver).
///
/// `Display` renders libpq conninfo with the password redacted, so the
/// value is safe to log.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    user: String,
    database: String,
    host: Option<String>,
    port: Option<u16>,
    password: Option<String>,
}

impl ConnectTarget {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user={} dbname={}", self.user, self.database)?;
        if let Some(host) = &self.host {
            write!(f, " host={}", host)?;
        }
        if let Some(port) = self.port {
            write!(f, " port={}", port)?;
        }
        if self.password.is_some() {
            f.write_str(" password=***")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("user", &self.user)
            .field("database", &self.database)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pass", &self.pass.as_ref().map(|_| "***"))
            .field("isolation", &self.isolation)
            .field("identity_mapper", &self.identity_mapper)
            .field("settings", &self.settings)
            .finish()
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectTarget({})", self)
    }
}
