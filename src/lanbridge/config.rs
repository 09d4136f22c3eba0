use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::lanbridge::tunnel::transport::{ClientTlsOptions, ServerTlsOptions};

pub const MAX_READY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

    // clap maps LANBRIDGE_CONFIG into the flag already; this covers callers
    // that pass `None` directly.
    if let Some(p) = std::env::var_os("LANBRIDGE_CONFIG") {
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
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("lanbridge.toml"));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["lanbridge.toml", "lanbridge.yaml", "lanbridge.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no lanbridge.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/lanbridge/lanbridge.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "lanbridge", "lanbridge")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("lanbridge.toml"))
    }
}

/// Write the default template to `path` if nothing is there yet.
///
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
    match extension_of(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension_of(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        ext => anyhow::bail!("config: unsupported config extension {ext:?}"),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub servers: Vec<ServerConfig>,
    pub agents: Vec<AgentConfig>,
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub bind_key: String,
    pub relay_bind_host: String,
    pub handshake_timeout: Duration,
    pub pair_timeout: Duration,
    pub idle_timeout: Duration,
    pub heartbeat: Duration,
    pub tls: ServerTlsOptions,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: String,
    pub open_addr: String,
    pub app_addr: String,
    pub bind_key: String,
    pub max_ready: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub heartbeat: Duration,
    pub rebind_backoff: Duration,
    pub encrypt_key: Option<String>,
    pub tls: ClientTlsOptions,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub listen_addr: String,
    pub server_addr: String,
    pub encrypt_key: Option<String>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    #[serde(default)]
    servers: Vec<FileServer>,

    #[serde(default)]
    agents: Vec<FileAgent>,

    #[serde(default)]
    clients: Vec<FileClient>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    bind_key: String,
    relay_bind_host: Option<String>,
    handshake_timeout_ms: Option<i64>,
    pair_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    heartbeat_secs: Option<i64>,
    tls: Option<FileServerTls>,
}

#[derive(Debug, Deserialize)]
struct FileServerTls {
    #[serde(default)]
    enabled: bool,
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAgent {
    #[serde(default)]
    server_addr: String,
    #[serde(default)]
    open_addr: String,
    #[serde(default)]
    app_addr: String,
    #[serde(default)]
    bind_key: String,
    max_ready: Option<i64>,
    connect_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    heartbeat_secs: Option<i64>,
    rebind_backoff_ms: Option<i64>,
    encrypt_key: Option<String>,
    tls: Option<FileClientTls>,
}

#[derive(Debug, Deserialize)]
struct FileClientTls {
    #[serde(default)]
    enabled: bool,
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    ca_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    #[serde(default)]
    listen_addr: String,
    #[serde(default)]
    server_addr: String,
    encrypt_key: Option<String>,
    connect_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.map(|v| v.max(0) as u64).unwrap_or(default_ms))
}

fn secs(v: Option<i64>, default_secs: u64) -> Duration {
    Duration::from_secs(v.map(|v| v.max(0) as u64).unwrap_or(default_secs))
}

/// Zero would mean "wait forever" for a dial or handshake, which is never wanted.
fn positive(d: Duration, default_ms: u64) -> Duration {
    if d.is_zero() {
        Duration::from_millis(default_ms)
    } else {
        d
    }
}

fn trimmed(s: &str) -> String {
    s.trim().to_string()
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let logging = match &fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.clone().unwrap_or_else(|| "info".into()),
                format: l.format.clone().unwrap_or_else(|| "json".into()),
                output: l.output.clone().unwrap_or_else(|| "stderr".into()),
                add_source: l.add_source,
            },
            None => LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
        };

        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            servers: vec![],
            agents: vec![],
            clients: vec![],
        };

        // --- Servers ---
        for (i, s) in fc.servers.iter().enumerate() {
            let listen_addr = trimmed(&s.listen_addr);
            if listen_addr.is_empty() {
                anyhow::bail!("config: servers[{i}] missing listen_addr");
            }
            let tls = match &s.tls {
                Some(t) => ServerTlsOptions {
                    enabled: t.enabled,
                    cert_file: non_empty(t.cert_file.as_ref()).unwrap_or_default(),
                    key_file: non_empty(t.key_file.as_ref()).unwrap_or_default(),
                },
                None => ServerTlsOptions::default(),
            };
            if tls.cert_file.is_empty() != tls.key_file.is_empty() {
                anyhow::bail!("config: servers[{i}].tls needs both cert_file and key_file (or neither)");
            }
            cfg.servers.push(ServerConfig {
                listen_addr,
                bind_key: s.bind_key.clone(),
                relay_bind_host: non_empty(s.relay_bind_host.as_ref())
                    .unwrap_or_else(|| "0.0.0.0".into()),
                handshake_timeout: positive(millis(s.handshake_timeout_ms, 10_000), 10_000),
                pair_timeout: positive(millis(s.pair_timeout_ms, 10_000), 10_000),
                idle_timeout: millis(s.idle_timeout_ms, 0),
                heartbeat: secs(s.heartbeat_secs, 30),
                tls,
            });
        }

        // --- Agents ---
        for (i, a) in fc.agents.iter().enumerate() {
            let server_addr = trimmed(&a.server_addr);
            let open_addr = trimmed(&a.open_addr);
            let app_addr = trimmed(&a.app_addr);
            if server_addr.is_empty() {
                anyhow::bail!("config: agents[{i}] missing server_addr");
            }
            if open_addr.is_empty() {
                anyhow::bail!("config: agents[{i}] missing open_addr");
            }
            if app_addr.is_empty() {
                anyhow::bail!("config: agents[{i}] missing app_addr");
            }

            let max_ready = a.max_ready.unwrap_or(5);
            if max_ready < 1 || max_ready > MAX_READY_LIMIT as i64 {
                anyhow::bail!(
                    "config: agents[{i}] max_ready must be within 1..={MAX_READY_LIMIT}, got {max_ready}"
                );
            }

            let tls = match &a.tls {
                Some(t) => ClientTlsOptions {
                    enabled: t.enabled,
                    server_name: non_empty(t.server_name.as_ref()).unwrap_or_default(),
                    insecure_skip_verify: t.insecure_skip_verify,
                    ca_file: non_empty(t.ca_file.as_ref()).unwrap_or_default(),
                },
                None => ClientTlsOptions::default(),
            };
            if tls.enabled && !tls.insecure_skip_verify && tls.ca_file.is_empty() {
                anyhow::bail!("config: agents[{i}].tls needs ca_file or insecure_skip_verify");
            }

            cfg.agents.push(AgentConfig {
                server_addr,
                open_addr,
                app_addr,
                bind_key: a.bind_key.clone(),
                max_ready: max_ready as usize,
                connect_timeout: positive(millis(a.connect_timeout_ms, 10_000), 10_000),
                handshake_timeout: positive(millis(a.handshake_timeout_ms, 10_000), 10_000),
                idle_timeout: millis(a.idle_timeout_ms, 0),
                heartbeat: secs(a.heartbeat_secs, 30),
                rebind_backoff: positive(millis(a.rebind_backoff_ms, 5_000), 5_000),
                encrypt_key: non_empty(a.encrypt_key.as_ref()),
                tls,
            });
        }

        // --- Clients ---
        for (i, c) in fc.clients.iter().enumerate() {
            let listen_addr = trimmed(&c.listen_addr);
            let server_addr = trimmed(&c.server_addr);
            if listen_addr.is_empty() {
                anyhow::bail!("config: clients[{i}] missing listen_addr");
            }
            if server_addr.is_empty() {
                anyhow::bail!("config: clients[{i}] missing server_addr");
            }
            cfg.clients.push(ClientConfig {
                listen_addr,
                server_addr,
                encrypt_key: non_empty(c.encrypt_key.as_ref()),
                connect_timeout: positive(millis(c.connect_timeout_ms, 10_000), 10_000),
                handshake_timeout: positive(millis(c.handshake_timeout_ms, 10_000), 10_000),
                idle_timeout: millis(c.idle_timeout_ms, 0),
            });
        }

        if cfg.servers.is_empty() && cfg.agents.is_empty() && cfg.clients.is_empty() {
            anyhow::bail!("config: nothing to run (configure servers, agents or clients)");
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# lanbridge configuration (auto-generated)
#
# This file was created because lanbridge could not find a configuration file
# at the resolved config path.
#
# The default runs a bind server on :9980. LAN agents connect to it with the
# same bind_key and ask for a public port; see the commented agent below.

admin_addr = ""

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[[servers]]
listen_addr = ":9980"
bind_key = "change-me"
relay_bind_host = "0.0.0.0"
handshake_timeout_ms = 10000
pair_timeout_ms = 10000
idle_timeout_ms = 0
heartbeat_secs = 30

# [[agents]]
# server_addr = "relay.example.com:9980"
# open_addr = ":8080"
# app_addr = "127.0.0.1:80"
# bind_key = "change-me"
# max_ready = 5
# encrypt_key = ""
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# lanbridge configuration (auto-generated)
#
# This file was created because lanbridge could not find a configuration file
# at the resolved config path.
#
# The default runs a bind server on :9980. LAN agents connect to it with the
# same bind_key and ask for a public port; see the commented agent below.

admin_addr: ""

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

servers:
  - listen_addr: ":9980"
    bind_key: "change-me"
    relay_bind_host: "0.0.0.0"
    handshake_timeout_ms: 10000
    pair_timeout_ms: 10000
    idle_timeout_ms: 0
    heartbeat_secs: 30

# agents:
#   - server_addr: "relay.example.com:9980"
#     open_addr: ":8080"
#     app_addr: "127.0.0.1:80"
#     bind_key: "change-me"
#     max_ready: 5
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
            "lanbridge_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn load_str(name: &str, file: &str, body: &str) -> anyhow::Result<Config> {
        let dir = temp_dir(name);
        let path = dir.join(file);
        std::fs::write(&path, body).expect("write");
        let res = load_config(&path);
        let _ = std::fs::remove_dir_all(&dir);
        res
    }

    #[test]
    fn default_templates_load() {
        for file in ["lanbridge.toml", "lanbridge.yaml"] {
            let dir = temp_dir("template");
            let path = dir.join("nested").join(file);
            assert!(ensure_config_file(&path).unwrap());
            assert!(!ensure_config_file(&path).unwrap());

            let cfg = load_config(&path).unwrap();
            assert_eq!(cfg.servers.len(), 1);
            assert_eq!(cfg.servers[0].listen_addr, ":9980");
            assert!(cfg.agents.is_empty());
            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn full_toml() {
        let cfg = load_str(
            "full",
            "lanbridge.toml",
            r#"
admin_addr = "127.0.0.1:9090"

[logging]
level = "debug"
format = "text"

[[servers]]
listen_addr = ":9980"
bind_key = "k"
heartbeat_secs = 10
[servers.tls]
enabled = true

[[agents]]
server_addr = "relay.example.com:9980"
open_addr = ":8081"
app_addr = "127.0.0.1:80"
bind_key = "k"
max_ready = 16
encrypt_key = "secret"
[agents.tls]
enabled = true
insecure_skip_verify = true

[[clients]]
listen_addr = "127.0.0.1:8080"
server_addr = "relay.example.com:8081"
encrypt_key = "secret"
idle_timeout_ms = 60000
"#,
        )
        .unwrap();

        assert_eq!(cfg.admin_addr, "127.0.0.1:9090");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.output, "stderr");

        let s = &cfg.servers[0];
        assert_eq!(s.relay_bind_host, "0.0.0.0");
        assert_eq!(s.heartbeat, Duration::from_secs(10));
        assert_eq!(s.pair_timeout, Duration::from_secs(10));
        assert!(s.tls.enabled);

        let a = &cfg.agents[0];
        assert_eq!(a.max_ready, 16);
        assert_eq!(a.encrypt_key.as_deref(), Some("secret"));
        assert_eq!(a.rebind_backoff, Duration::from_secs(5));
        assert!(a.tls.insecure_skip_verify);

        let c = &cfg.clients[0];
        assert_eq!(c.idle_timeout, Duration::from_secs(60));
        assert_eq!(c.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn yaml_agent_defaults() {
        let cfg = load_str(
            "yaml",
            "lanbridge.yaml",
            r#"
agents:
  - server_addr: "203.0.113.7:9980"
    open_addr: "8081"
    app_addr: "127.0.0.1:22"
    encrypt_key: "  "
    connect_timeout_ms: 0
"#,
        )
        .unwrap();
        let a = &cfg.agents[0];
        assert_eq!(a.max_ready, 5);
        assert_eq!(a.encrypt_key, None);
        assert_eq!(a.connect_timeout, Duration::from_secs(10));
        assert_eq!(a.idle_timeout, Duration::ZERO);
        assert_eq!(a.heartbeat, Duration::from_secs(30));
    }

    #[test]
    fn max_ready_is_bounded() {
        for bad in [0, 1025] {
            let body = format!(
                "[[agents]]\nserver_addr = \"a:1\"\nopen_addr = \":2\"\napp_addr = \"b:3\"\nmax_ready = {bad}\n"
            );
            let err = load_str("max_ready", "lanbridge.toml", &body).unwrap_err();
            assert!(format!("{err:#}").contains("agents[0] max_ready"), "{err:#}");
        }
    }

    #[test]
    fn missing_fields_name_the_entry() {
        let err = load_str(
            "missing",
            "lanbridge.toml",
            "[[servers]]\nlisten_addr = \":1\"\n[[servers]]\nbind_key = \"k\"\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("servers[1] missing listen_addr"));

        let err = load_str(
            "missing_app",
            "lanbridge.toml",
            "[[agents]]\nserver_addr = \"a:1\"\nopen_addr = \":2\"\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("agents[0] missing app_addr"));
    }

    #[test]
    fn empty_config_is_rejected() {
        let err = load_str("empty", "lanbridge.toml", "admin_addr = \":9090\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("nothing to run"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = load_str(
            "unknown",
            "lanbridge.toml",
            "[[servers]]\nlisten_addr = \":1\"\nbind_secret = \"k\"\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("bind_secret"));
    }

    #[test]
    fn agent_tls_needs_trust() {
        let err = load_str(
            "tls",
            "lanbridge.toml",
            "[[agents]]\nserver_addr = \"a:1\"\nopen_addr = \":2\"\napp_addr = \"b:3\"\n[agents.tls]\nenabled = true\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("ca_file or insecure_skip_verify"));
    }

    #[test]
    fn explicit_dir_resolves_to_file_inside() {
        let dir = temp_dir("resolve");
        let r = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(r.path, dir.join("lanbridge.toml"));

        std::fs::write(dir.join("lanbridge.yaml"), "").unwrap();
        let r = resolve_config_path(Some(dir.clone())).unwrap();
        assert_eq!(r.path, dir.join("lanbridge.yaml"));

        let r = resolve_config_path(Some(dir.join("custom"))).unwrap();
        assert_eq!(r.path, dir.join("custom.toml"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
