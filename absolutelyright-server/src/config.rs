use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Deployment volume used when present.
const VOLUME_DIR: &str = "/app/data";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
    pub database_path: Option<PathBuf>,
    pub secret: Option<String>,
    pub static_dir: PathBuf,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3003,
            database_path: None,
            secret: None,
            static_dir: PathBuf::from("frontend"),
        }
    }
}

impl ServerConfig {
    /// Load `path`, or defaults when it doesn't exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// `PORT`, `DATABASE_PATH` and `ABSOLUTELYRIGHT_SECRET` override the file.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            match port.trim().parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid PORT"),
            }
        }
        if let Some(path) = lookup("DATABASE_PATH").filter(|v| !v.is_empty()) {
            self.server.database_path = Some(PathBuf::from(path));
        }
        if let Some(secret) = lookup("ABSOLUTELYRIGHT_SECRET").filter(|v| !v.is_empty()) {
            self.server.secret = Some(secret);
        }
    }

    /// Configured database path, else the deployment volume, else `counts.db`.
    pub fn database_path(&self) -> PathBuf {
        if let Some(ref path) = self.server.database_path {
            return path.clone();
        }
        default_database_path(Path::new(VOLUME_DIR))
    }
}

fn default_database_path(volume: &Path) -> PathBuf {
    if volume.is_dir() {
        volume.join("counts.db")
    } else {
        PathBuf::from("counts.db")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServerConfig::load(&dir.path().join("absolutelyright-server.toml")).unwrap();
        assert_eq!(cfg.server.port, 3003);
        assert_eq!(cfg.server.bind, "0.0.0.0");
        assert!(cfg.server.secret.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absolutelyright-server.toml");
        std::fs::write(&path, "[server]\nport = 8080\nsecret = \"file\"\n").unwrap();

        let mut cfg = ServerConfig::load(&path).unwrap();
        assert_eq!(cfg.server.port, 8080);

        cfg.apply_env(|k| match k {
            "PORT" => Some("9000".to_string()),
            "DATABASE_PATH" => Some("/tmp/x.db".to_string()),
            "ABSOLUTELYRIGHT_SECRET" => Some("env".to_string()),
            _ => None,
        });
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.database_path(), PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.server.secret.as_deref(), Some("env"));
    }

    #[test]
    fn invalid_port_is_ignored() {
        let mut cfg = ServerConfig::default();
        cfg.apply_env(|k| (k == "PORT").then(|| "http".to_string()));
        assert_eq!(cfg.server.port, 3003);
    }

    #[test]
    fn database_path_prefers_volume() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(default_database_path(dir.path()), dir.path().join("counts.db"));
        assert_eq!(
            default_database_path(&dir.path().join("missing")),
            PathBuf::from("counts.db")
        );
    }

    #[test]
    fn bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absolutelyright-server.toml");
        std::fs::write(&path, "[server\n").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }
}
