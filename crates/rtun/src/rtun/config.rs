use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::rtun::tunnel::{Dial, FrameCodec, Listen, TunnelOptions};

pub const CONFIG_ENV: &str = "RTUN_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps RTUN_CONFIG into the flag already; this covers callers that bypass clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("rtun.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["rtun.toml", "rtun.yaml", "rtun.yml"] {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no rtun.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/rtun/rtun.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj =
            ProjectDirs::from("dev", "rtun", "rtun").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("rtun.toml"))
    }
}

/// Writes the default template to `path` unless a file is already there.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

/// Multiplexer tuning shared by the server and the client.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub wait_timeout: Duration,
    pub copy_buffer_size: usize,
    pub queue_capacity: usize,
    pub max_frame_bytes: u32,
}

impl TunnelConfig {
    pub fn options(&self) -> TunnelOptions {
        TunnelOptions {
            codec: FrameCodec::new(self.max_frame_bytes),
            wait_timeout: self.wait_timeout,
            copy_buffer_size: self.copy_buffer_size,
            queue_capacity: self.queue_capacity,
            ..TunnelOptions::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub username: String,
    pub password: String,
    /// Sent with every Open; empty lets the client decide.
    pub dial: Dial,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub key: String,
    pub username: String,
    pub password: String,
    pub listen: Option<Listen>,
    pub backend: Option<Dial>,
    pub dial_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    tunnel: Option<FileTunnel>,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    wait_timeout_ms: Option<i64>,
    copy_buffer_size: Option<i64>,
    queue_capacity: Option<i64>,
    max_frame_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    username: Option<String>,
    password: Option<String>,
    dial_address: Option<String>,
    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    key: Option<String>,
    username: Option<String>,
    password: Option<String>,
    listen_port: Option<u16>,
    backend_addr: Option<String>,
    dial_timeout_ms: Option<i64>,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default),
    }
}

fn positive(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

fn trimmed(v: &Option<String>) -> String {
    v.as_deref().unwrap_or_default().trim().to_string()
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let defaults = TunnelOptions::default();
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
            tunnel: TunnelConfig {
                wait_timeout: defaults.wait_timeout,
                copy_buffer_size: defaults.copy_buffer_size,
                queue_capacity: defaults.queue_capacity,
                max_frame_bytes: defaults.codec.max_frame_bytes,
            },
            server: None,
            client: None,
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.level = level.to_string();
            }
            if let Some(fmt) = l.format.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.format = fmt.to_string();
            }
            if let Some(out) = l.output.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                cfg.logging.output = out.to_string();
            }
            cfg.logging.add_source = l.add_source;
        }

        // --- Tunnel tuning ---
        if let Some(t) = &fc.tunnel {
            cfg.tunnel.wait_timeout = millis(t.wait_timeout_ms, 5000);
            cfg.tunnel.copy_buffer_size = positive(t.copy_buffer_size, defaults.copy_buffer_size);
            cfg.tunnel.queue_capacity = positive(t.queue_capacity, defaults.queue_capacity);
            if let Some(n) = t.max_frame_bytes.filter(|n| *n > 0) {
                cfg.tunnel.max_frame_bytes = u32::try_from(n)
                    .context("config: tunnel.max_frame_bytes exceeds 4 GiB")?;
            }
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            let listen_addr = trimmed(&s.listen_addr);
            let dial_address = trimmed(&s.dial_address);
            let dial = if dial_address.is_empty() {
                Dial::default()
            } else {
                Dial::tcp(dial_address).with_timeout(millis(s.dial_timeout_ms, 5000))
            };
            cfg.server = Some(ServerConfig {
                listen_addr: if listen_addr.is_empty() {
                    ":7000".into()
                } else {
                    listen_addr
                },
                username: trimmed(&s.username),
                password: s.password.clone().unwrap_or_default(),
                dial,
            });
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            let server_addr = c.server_addr.trim().to_string();
            if server_addr.is_empty() {
                anyhow::bail!("config: client.server_addr is required");
            }
            let key = trimmed(&c.key);
            if key.contains('#') {
                anyhow::bail!("config: client.key must not contain '#'");
            }
            let dial_timeout = millis(c.dial_timeout_ms, 5000);
            let backend_addr = trimmed(&c.backend_addr);
            cfg.client = Some(ClientConfig {
                server_addr,
                key,
                username: trimmed(&c.username),
                password: c.password.clone().unwrap_or_default(),
                listen: c.listen_port.map(Listen::tcp),
                backend: (!backend_addr.is_empty())
                    .then(|| Dial::tcp(backend_addr).with_timeout(dial_timeout)),
                dial_timeout,
            });
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# rtun configuration (auto-generated)
#
# This file was created because rtun could not find a configuration file at the
# resolved config path. It starts a tunnel server on :7000 that accepts any
# client. Add a [client] section (and drop [server]) to run the other end.

admin_addr = ":8080"

[logging]
level = "info"   # trace | debug | info | warn | error
format = "text"  # text | json
output = "stderr"
add_source = false

[tunnel]
wait_timeout_ms = 5000
copy_buffer_size = 32768
queue_capacity = 20
max_frame_bytes = 16777216

[server]
listen_addr = ":7000"
username = ""
password = ""
# Backend every exposed connection is opened against; empty lets the client decide.
dial_address = ""

# [client]
# server_addr = "tunnel.example.com:7000"
# key = "office"
# username = ""
# password = ""
# listen_port = 8022            # port the server should expose
# backend_addr = "127.0.0.1:22" # where exposed connections end up
# dial_timeout_ms = 5000
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# rtun configuration (auto-generated)
#
# This file was created because rtun could not find a configuration file at the
# resolved config path. It starts a tunnel server on :7000 that accepts any
# client. Add a client section (and drop server) to run the other end.

admin_addr: ":8080"

logging:
  level: "info"   # trace | debug | info | warn | error
  format: "text"  # text | json
  output: "stderr"
  add_source: false

tunnel:
  wait_timeout_ms: 5000
  copy_buffer_size: 32768
  queue_capacity: 20
  max_frame_bytes: 16777216

server:
  listen_addr: ":7000"
  username: ""
  password: ""
  # Backend every exposed connection is opened against; empty lets the client decide.
  dial_address: ""

# client:
#   server_addr: "tunnel.example.com:7000"
#   key: "office"
#   listen_port: 8022
#   backend_addr: "127.0.0.1:22"
#   dial_timeout_ms: 5000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "rtun_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn templates_are_loadable() {
        let dir = temp_dir("templates");
        for name in ["rtun.toml", "rtun.yaml"] {
            let p = dir.join(name);
            assert!(ensure_config_file(&p).expect("ensure"));
            assert!(!ensure_config_file(&p).expect("ensure again"));

            let cfg = load_config(&p).expect("load_config");
            assert_eq!(cfg.admin_addr, ":8080");
            let server = cfg.server.expect("server section");
            assert_eq!(server.listen_addr, ":7000");
            assert!(server.dial.address.is_empty());
            assert!(cfg.client.is_none());
            assert_eq!(cfg.tunnel.copy_buffer_size, 32 * 1024);
            assert_eq!(cfg.tunnel.queue_capacity, 20);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn client_section_maps_to_descriptors() {
        let dir = temp_dir("client");
        let cfg_path = dir.join("rtun.toml");

        let toml = r#"
[logging]
level = "debug"

[tunnel]
wait_timeout_ms = 250
queue_capacity = 0

[client]
server_addr = " tunnel.example.com:7000 "
key = "office"
listen_port = 8022
backend_addr = "127.0.0.1:22"
dial_timeout_ms = 1500
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.tunnel.wait_timeout, Duration::from_millis(250));
        assert_eq!(cfg.tunnel.queue_capacity, 20);
        assert!(cfg.server.is_none());

        let c = cfg.client.expect("client");
        assert_eq!(c.server_addr, "tunnel.example.com:7000");
        assert_eq!(c.listen, Some(Listen::tcp(8022)));
        let backend = c.backend.expect("backend");
        assert_eq!(backend.address, "127.0.0.1:22");
        assert_eq!(backend.timeout(), Some(Duration::from_millis(1500)));

        let opts = cfg.tunnel.options();
        assert_eq!(opts.wait_timeout, Duration::from_millis(250));
        assert!(!opts.registered);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("rtun.toml");

        std::fs::write(&cfg_path, "[server]\nauth_token = \"x\"\n").expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("auth_token"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn client_key_with_separator_is_rejected() {
        let dir = temp_dir("badkey");
        let cfg_path = dir.join("rtun.yaml");

        std::fs::write(&cfg_path, "client:\n  server_addr: \"a:1\"\n  key: \"a#b\"\n")
            .expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("client.key"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_resolves_to_contained_config() {
        let dir = temp_dir("explicit");
        let resolved = resolve_config_path(Some(dir.clone())).expect("resolve");
        assert_eq!(resolved.source, ConfigPathSource::Flag);
        assert_eq!(resolved.path, dir.join("rtun.toml"));

        std::fs::write(dir.join("rtun.yml"), "admin_addr: \"\"\n").expect("write");
        let resolved = resolve_config_path(Some(dir.clone())).expect("resolve");
        assert_eq!(resolved.path, dir.join("rtun.yml"));

        let resolved = resolve_config_path(Some(dir.join("custom"))).expect("resolve");
        assert_eq!(resolved.path, dir.join("custom.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        let dir = temp_dir("ext");
        assert!(ensure_config_file(&dir.join("rtun.json")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
