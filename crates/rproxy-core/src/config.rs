//! Minimal `key=value` properties-file config loader.
//!
//! Grounded on the teacher's general willingness to hand-roll a small, single-purpose parser
//! in a binary's own module (cf. `socks5-server`'s slice-pattern CLI parser) rather than pull in
//! a dependency for a one-screen job — `spec.md` §6's flat dotted keys (`server.bind`,
//! `config.socks.password`, ...) match neither the teacher's nested-JSON `ConfigFile` nor a TOML
//! table, so this format is purpose-built for them.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};

/// A parsed properties file: flat `key=value` pairs, `#`-prefixed comments and blank lines
/// ignored, later duplicate keys winning.
#[derive(Debug, Default, Clone)]
pub struct Properties {
    entries: HashMap<String, String>,
}

impl Properties {
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();

        for line in text.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }

        Self { entries }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_owned()
    }

    pub fn get_required(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(str::to_owned)
            .with_context(|| format!("missing required config key `{key}`"))
    }

    pub fn get_u16(&self, key: &str, default: u16) -> Result<u16> {
        match self.get(key) {
            Some(raw) => raw.parse().with_context(|| format!("config key `{key}` is not a valid port")),
            None => Ok(default),
        }
    }
}

/// Server-side configuration: the client-facing listener and the SOCKS5-facing listener.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub socks_bind: String,
    pub socks_port: u16,
    pub socks_password: String,
}

impl ServerConfig {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self {
            bind: props.get_or("server.bind", "0.0.0.0"),
            port: props.get_u16("server.port", 4900)?,
            socks_bind: props.get_or("config.socks.bind", "0.0.0.0"),
            socks_port: props.get_u16("config.socks.port", 1080)?,
            socks_password: props.get_required("config.socks.password")?,
        })
    }
}

/// Client-side configuration: the server's control-channel listener address.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub client_key: String,
}

impl ClientConfig {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        Ok(Self {
            server_host: props.get_required("server.host")?,
            server_port: props.get_u16("server.port", 4900)?,
            client_key: props.get_required("client.key")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_keys_and_skips_comments() {
        let props = Properties::parse(
            "# comment\n\nserver.bind=127.0.0.1\nserver.port=4900\nconfig.socks.password=11111\n",
        );

        assert_eq!(props.get("server.bind"), Some("127.0.0.1"));
        assert_eq!(props.get_u16("server.port", 0).unwrap(), 4900);
        assert_eq!(props.get("config.socks.password"), Some("11111"));
    }

    #[test]
    fn server_config_applies_defaults() {
        let props = Properties::parse("config.socks.password=hunter2\n");
        let cfg = ServerConfig::from_properties(&props).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.port, 4900);
        assert_eq!(cfg.socks_port, 1080);
        assert_eq!(cfg.socks_password, "hunter2");
    }

    #[test]
    fn server_config_requires_password() {
        let props = Properties::parse("server.bind=127.0.0.1\n");
        assert!(ServerConfig::from_properties(&props).is_err());
    }
}
