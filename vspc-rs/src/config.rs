//! Service configuration.
//!
//! Options arrive from an optional `key = value` config file plus
//! command-line overrides ([`crate::cli`]); both produce a partial
//! [`Settings`] and the merge resolves into a validated [`VspcConfig`].
//!
//! | Key | Default | Effect |
//! |-----|---------|--------|
//! | `host`, `port` | `0.0.0.0`, `13370` | VM listener bind |
//! | `client_host` | `127.0.0.1` | client-listener bind address |
//! | `vm_start_port` | `20000` | first port tried for client listeners |
//! | `admin_host`, `admin_port` | `127.0.0.1`, `13371` | admin listener bind |
//! | `enable_clients` | `false` | client listeners, fan-out, admin endpoint |
//! | `cert`, `key` | — | TLS for listeners; `key` falls back to `cert` |
//! | `uri` | required | URI a VM must present in DO-PROXY |
//! | `serial_log_dir` | required | directory for per-UUID serial logs |

use std::path::{Path, PathBuf};

// ── ConfigError ───────────────────────────────────────────────────────────

/// A rejected configuration, with the offending line when one exists.
#[derive(Debug)]
pub struct ConfigError {
    pub line: Option<usize>,
    pub message: String,
}

impl ConfigError {
    fn at(line: usize, message: impl Into<String>) -> Self {
        Self { line: Some(line), message: message.into() }
    }

    fn global(message: impl Into<String>) -> Self {
        Self { line: None, message: message.into() }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

// ── Settings (partial, mergeable) ─────────────────────────────────────────

/// One source's worth of options; `None` means "not set here".
#[derive(Debug, Default, Clone)]
pub struct Settings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client_host: Option<String>,
    pub vm_start_port: Option<u16>,
    pub admin_host: Option<String>,
    pub admin_port: Option<u16>,
    pub enable_clients: Option<bool>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub uri: Option<String>,
    pub serial_log_dir: Option<PathBuf>,
}

impl Settings {
    /// Parse a config-file string.  Blank lines and `#`/`;` comments are
    /// skipped; anything else must be `key = value` with a known key.
    pub fn load_str(s: &str) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        for (i, raw) in s.lines().enumerate() {
            let lineno = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::at(lineno, format!("expected key = value, got '{line}'")));
            };
            settings.set(key.trim(), value.trim(), lineno)?;
        }
        Ok(settings)
    }

    /// Read and parse a config file from disk.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::global(format!("{}: {e}", path.display())))?;
        Self::load_str(&s)
    }

    fn set(&mut self, key: &str, value: &str, lineno: usize) -> Result<(), ConfigError> {
        match key {
            "host" => self.host = Some(value.to_owned()),
            "port" => self.port = Some(parse_port(value, lineno)?),
            "client_host" => self.client_host = Some(value.to_owned()),
            "vm_start_port" => self.vm_start_port = Some(parse_port(value, lineno)?),
            "admin_host" => self.admin_host = Some(value.to_owned()),
            "admin_port" => self.admin_port = Some(parse_port(value, lineno)?),
            "enable_clients" => {
                self.enable_clients = Some(match value {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(ConfigError::at(
                            lineno,
                            format!("expected true or false for enable_clients, got '{other}'"),
                        ))
                    }
                })
            }
            "cert" => self.cert = Some(PathBuf::from(value)),
            "key" => self.key = Some(PathBuf::from(value)),
            "uri" => self.uri = Some(value.to_owned()),
            "serial_log_dir" => self.serial_log_dir = Some(PathBuf::from(value)),
            other => {
                return Err(ConfigError::at(lineno, format!("unknown option '{other}'")));
            }
        }
        Ok(())
    }

    /// Overlay `over` on top of `self`; set fields in `over` win.
    pub fn merge(self, over: Settings) -> Settings {
        Settings {
            host: over.host.or(self.host),
            port: over.port.or(self.port),
            client_host: over.client_host.or(self.client_host),
            vm_start_port: over.vm_start_port.or(self.vm_start_port),
            admin_host: over.admin_host.or(self.admin_host),
            admin_port: over.admin_port.or(self.admin_port),
            enable_clients: over.enable_clients.or(self.enable_clients),
            cert: over.cert.or(self.cert),
            key: over.key.or(self.key),
            uri: over.uri.or(self.uri),
            serial_log_dir: over.serial_log_dir.or(self.serial_log_dir),
        }
    }

    /// Apply defaults and required-field checks.
    pub fn into_config(self) -> Result<VspcConfig, ConfigError> {
        let uri = self
            .uri
            .ok_or_else(|| ConfigError::global("uri is not specified"))?;
        let serial_log_dir = self
            .serial_log_dir
            .ok_or_else(|| ConfigError::global("serial_log_dir is not specified"))?;
        let key = self.key.or_else(|| self.cert.clone());
        Ok(VspcConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: self.port.unwrap_or(13370),
            client_host: self.client_host.unwrap_or_else(|| "127.0.0.1".to_owned()),
            vm_start_port: self.vm_start_port.unwrap_or(20000),
            admin_host: self.admin_host.unwrap_or_else(|| "127.0.0.1".to_owned()),
            admin_port: self.admin_port.unwrap_or(13371),
            enable_clients: self.enable_clients.unwrap_or(false),
            cert: self.cert,
            key,
            uri,
            serial_log_dir,
        })
    }
}

fn parse_port(value: &str, lineno: usize) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::at(lineno, format!("invalid port number '{value}'")))
}

// ── VspcConfig ────────────────────────────────────────────────────────────

/// The fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct VspcConfig {
    pub host: String,
    pub port: u16,
    pub client_host: String,
    pub vm_start_port: u16,
    pub admin_host: String,
    pub admin_port: u16,
    pub enable_clients: bool,
    pub cert: Option<PathBuf>,
    /// Always set when `cert` is (falls back to the cert file).
    pub key: Option<PathBuf>,
    pub uri: String,
    pub serial_log_dir: PathBuf,
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_file_parses() {
        let s = Settings::load_str(
            "# VSPC config\n\
             host = 10.0.0.1\n\
             port = 1234\n\
             client_host = 10.0.0.2\n\
             vm_start_port = 30000\n\
             admin_host = 10.0.0.3\n\
             admin_port = 4321\n\
             enable_clients = true\n\
             cert = /etc/vspc/cert.pem\n\
             key = /etc/vspc/key.pem\n\
             uri = vspc://example\n\
             serial_log_dir = /var/log/vspc\n",
        )
        .unwrap();
        let config = s.into_config().unwrap();
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 1234);
        assert_eq!(config.client_host, "10.0.0.2");
        assert_eq!(config.vm_start_port, 30000);
        assert_eq!(config.admin_port, 4321);
        assert!(config.enable_clients);
        assert_eq!(config.key, Some(PathBuf::from("/etc/vspc/key.pem")));
        assert_eq!(config.uri, "vspc://example");
    }

    #[test]
    fn defaults_apply() {
        let s = Settings::load_str("uri = vspc://x\nserial_log_dir = /tmp/logs\n").unwrap();
        let config = s.into_config().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 13370);
        assert_eq!(config.client_host, "127.0.0.1");
        assert_eq!(config.vm_start_port, 20000);
        assert_eq!(config.admin_host, "127.0.0.1");
        assert_eq!(config.admin_port, 13371);
        assert!(!config.enable_clients);
        assert!(config.cert.is_none());
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let s = Settings::load_str(
            "\n# comment\n; another\n  uri = vspc://x  \nserial_log_dir = /d\n",
        )
        .unwrap();
        assert_eq!(s.uri.as_deref(), Some("vspc://x"));
    }

    #[test]
    fn unknown_key_rejected_with_line() {
        let err = Settings::load_str("uri = x\nbogus = 1\n").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn bad_port_rejected() {
        let err = Settings::load_str("port = high\n").unwrap_err();
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn bad_bool_rejected() {
        assert!(Settings::load_str("enable_clients = yes\n").is_err());
    }

    #[test]
    fn missing_equals_rejected() {
        assert!(Settings::load_str("host 1.2.3.4\n").is_err());
    }

    #[test]
    fn required_fields_enforced() {
        let err = Settings::load_str("serial_log_dir = /d\n")
            .unwrap()
            .into_config()
            .unwrap_err();
        assert!(err.message.contains("uri"));

        let err = Settings::load_str("uri = x\n")
            .unwrap()
            .into_config()
            .unwrap_err();
        assert!(err.message.contains("serial_log_dir"));
    }

    #[test]
    fn merge_prefers_overrides() {
        let base = Settings::load_str("port = 1111\nuri = base\nserial_log_dir = /d\n").unwrap();
        let over = Settings {
            port: Some(2222),
            ..Settings::default()
        };
        let config = base.merge(over).into_config().unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.uri, "base");
    }

    #[test]
    fn key_defaults_to_cert() {
        let s = Settings::load_str(
            "cert = /etc/cert.pem\nuri = x\nserial_log_dir = /d\n",
        )
        .unwrap();
        let config = s.into_config().unwrap();
        assert_eq!(config.key, Some(PathBuf::from("/etc/cert.pem")));
    }
}
