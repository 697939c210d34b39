//! Application configuration.
//!
//! Burrow is configured through an INI file: one `[app]` section for the
//! process-wide settings, and one additional section per mapping. The
//! reader produces an immutable, validated [`AppConfig`]; malformed
//! mapping sections are skipped the way a human edit would expect, while
//! an unusable `[app]` section refuses to start.

use burrow_proto::MappingType;
use ini::{Ini, Properties};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Smallest accepted per-connection read buffer.
pub const ALIGNMENT_MIN: usize = 510;

/// Largest usable read buffer: a full frame minus the packet header.
pub const ALIGNMENT_MAX: usize = burrow_proto::MAX_FRAME_LEN - burrow_proto::PACKET_HEADER_LEN;

const DEFAULT_BACKLOG: u32 = 511;
const DEFAULT_CONNECT_TIMEOUT: u64 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 5;
const DEFAULT_INACTIVE_TIMEOUT: u64 = 72;

/// Cipher-suite string applied when `protocol.{ssl,tls}.ciphersuites`
/// is left empty.
pub const DEFAULT_CIPHERSUITES: &str =
    "TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256:TLS_AES_128_GCM_SHA256";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Read(#[from] ini::Error),

    #[error("configuration has no [app] section")]
    MissingAppSection,

    #[error("app.port must be in 1..=65535")]
    InvalidPort,

    #[error("app.ip {0:?} is not a usable {1} address")]
    InvalidAddress(String, &'static str),

    #[error("app.mode {0:?} is not recognised")]
    InvalidMode(String),

    #[error("app.protocol {0:?} is not recognised")]
    InvalidProtocol(String),

    #[error("protocol.encryptor requires both method and password")]
    IncompleteEncryptor,

    #[error("protocol.websocket.host must be set")]
    MissingWebSocketHost,

    #[error("protocol.websocket.path must start with '/'")]
    InvalidWebSocketPath,

    #[error("{0} must be set for this protocol")]
    MissingTlsSetting(&'static str),

    #[error("client configuration declares no usable mappings")]
    NoMappings,
}

/// Which role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Client => "client",
            Mode::Server => "server",
        }
    }
}

/// Transport protocol carrying the tunnels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Ssl,
    Tls,
    Encryptor,
    WebSocket,
    WebSocketSsl,
    WebSocketTls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
            Protocol::Tls => "tls",
            Protocol::Encryptor => "encryptor",
            Protocol::WebSocket => "websocket",
            Protocol::WebSocketSsl => "websocket+ssl",
            Protocol::WebSocketTls => "websocket+tls",
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(
            self,
            Protocol::Ssl | Protocol::Tls | Protocol::WebSocketSsl | Protocol::WebSocketTls
        )
    }

    pub fn uses_websocket(&self) -> bool {
        matches!(
            self,
            Protocol::WebSocket | Protocol::WebSocketSsl | Protocol::WebSocketTls
        )
    }
}

/// Shared-secret cipher settings (`protocol=encryptor`).
#[derive(Debug, Clone, Default)]
pub struct EncryptorConfig {
    pub method: String,
    pub password: String,
}

/// TLS settings, read from `protocol.ssl.*` or `protocol.tls.*`
/// depending on the selected protocol name.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub verify_peer: bool,
    pub host: String,
    pub certificate_file: String,
    pub certificate_key_file: String,
    pub certificate_chain_file: String,
    pub certificate_key_password: String,
    pub ciphersuites: String,
}

/// WebSocket upgrade settings.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConfig {
    pub host: String,
    pub path: String,
}

/// One public-port binding.
#[derive(Debug, Clone)]
pub struct MappingConfig {
    pub name: String,
    pub kind: MappingType,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub concurrent: usize,
    pub reconnect: Duration,
}

/// The validated process configuration, immutable after load.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: Mode,
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub alignment: usize,
    pub backlog: u32,
    pub fast_open: bool,
    pub turbo_lan: bool,
    pub turbo_wan: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub inactive_timeout: Duration,
    pub encryptor: EncryptorConfig,
    pub tls: TlsConfig,
    pub websocket: WebSocketConfig,
    pub mappings: Vec<MappingConfig>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_ini(Ini::load_from_file(path)?)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Self::from_ini(Ini::load_from_str(contents).map_err(ini::Error::Parse)?)
    }

    fn from_ini(ini: Ini) -> Result<Self, ConfigError> {
        let app = ini.section(Some("app")).ok_or(ConfigError::MissingAppSection)?;

        let mode = parse_mode(get_str(app, "mode"))?;
        let protocol = parse_protocol(get_str(app, "protocol"))?;

        let ip = parse_app_ip(get_str(app, "ip"), mode)?;
        let port = get_u64(app, "port");
        if port == 0 || port > u16::MAX as u64 {
            return Err(ConfigError::InvalidPort);
        }

        let alignment = (get_u64(app, "alignment") as usize).clamp(ALIGNMENT_MIN, ALIGNMENT_MAX);
        let backlog = match get_u64(app, "backlog") as u32 {
            0 => DEFAULT_BACKLOG,
            n => n,
        };

        let mut config = AppConfig {
            mode,
            ip,
            port: port as u16,
            protocol,
            alignment,
            backlog,
            fast_open: get_bool(app, "fast-open"),
            turbo_lan: get_bool(app, "turbo.lan"),
            turbo_wan: get_bool(app, "turbo.wan"),
            connect_timeout: timeout(app, "connect.timeout", DEFAULT_CONNECT_TIMEOUT),
            handshake_timeout: timeout(app, "handshake.timeout", DEFAULT_HANDSHAKE_TIMEOUT),
            inactive_timeout: timeout(app, "inactive.timeout", DEFAULT_INACTIVE_TIMEOUT),
            encryptor: EncryptorConfig::default(),
            tls: TlsConfig::default(),
            websocket: WebSocketConfig::default(),
            mappings: Vec::new(),
        };

        if protocol == Protocol::Encryptor {
            config.encryptor = load_encryptor(app)?;
        }
        if protocol.uses_tls() {
            config.tls = load_tls(app, protocol, mode)?;
        }
        if protocol.uses_websocket() {
            config.websocket = load_websocket(app)?;
        }

        for (section, props) in ini.iter() {
            let name = match section {
                Some(name) if name != "app" => name,
                _ => continue,
            };
            if let Some(mapping) = parse_mapping(name, props) {
                config.mappings.push(mapping);
            }
        }

        if config.mode == Mode::Client && config.mappings.is_empty() {
            return Err(ConfigError::NoMappings);
        }

        Ok(config)
    }
}

fn get_str<'a>(props: &'a Properties, key: &str) -> &'a str {
    props.get(key).unwrap_or("").trim()
}

fn get_u64(props: &Properties, key: &str) -> u64 {
    get_str(props, key).parse().unwrap_or(0)
}

fn get_bool(props: &Properties, key: &str) -> bool {
    matches!(
        get_str(props, key).to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn timeout(props: &Properties, key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(match get_u64(props, key) {
        0 => default_secs,
        n => n,
    })
}

fn parse_mode(value: &str) -> Result<Mode, ConfigError> {
    let mut chars = value.chars();
    match chars.next().map(|c| c.to_ascii_lowercase()) {
        None | Some('c') | Some('0') => Ok(Mode::Client),
        Some('s') | Some('1') => Ok(Mode::Server),
        Some(_) => Err(ConfigError::InvalidMode(value.to_owned())),
    }
}

fn parse_protocol(value: &str) -> Result<Protocol, ConfigError> {
    let lowered = value.to_ascii_lowercase();
    let protocol = match lowered.chars().next() {
        None => Protocol::Tcp,
        Some('w') => {
            if lowered.contains("tls") {
                Protocol::WebSocketTls
            } else if lowered.contains("ssl") {
                Protocol::WebSocketSsl
            } else {
                Protocol::WebSocket
            }
        }
        Some('e') => Protocol::Encryptor,
        Some('s') => Protocol::Ssl,
        Some('t') if lowered.starts_with("tl") => Protocol::Tls,
        Some('t') => Protocol::Tcp,
        Some(digit @ '0'..='6') => match digit {
            '0' => Protocol::Tcp,
            '1' => Protocol::Ssl,
            '2' => Protocol::Tls,
            '3' => Protocol::Encryptor,
            '4' => Protocol::WebSocket,
            '5' => Protocol::WebSocketSsl,
            _ => Protocol::WebSocketTls,
        },
        Some(_) => return Err(ConfigError::InvalidProtocol(value.to_owned())),
    };
    Ok(protocol)
}

fn parse_app_ip(value: &str, mode: Mode) -> Result<IpAddr, ConfigError> {
    let ip = value
        .parse::<IpAddr>()
        .unwrap_or(IpAddr::from([0u8, 0, 0, 0]));
    // A server binds the wildcard happily; a client has to reach a peer.
    if mode == Mode::Client && (ip.is_unspecified() || ip.is_multicast()) {
        return Err(ConfigError::InvalidAddress(value.to_owned(), "connect"));
    }
    if ip.is_multicast() {
        return Err(ConfigError::InvalidAddress(value.to_owned(), "listen"));
    }
    Ok(ip)
}

fn load_encryptor(app: &Properties) -> Result<EncryptorConfig, ConfigError> {
    let method = get_str(app, "protocol.encryptor.method").to_owned();
    let password = get_str(app, "protocol.encryptor.password").to_owned();
    if method.is_empty() || password.is_empty() {
        return Err(ConfigError::IncompleteEncryptor);
    }
    Ok(EncryptorConfig { method, password })
}

fn load_tls(app: &Properties, protocol: Protocol, mode: Mode) -> Result<TlsConfig, ConfigError> {
    // `protocol=ssl` and `protocol=websocket+ssl` read the `protocol.ssl.*`
    // keys, the tls spellings read `protocol.tls.*`.
    let prefix = match protocol {
        Protocol::Tls | Protocol::WebSocketTls => "protocol.tls",
        _ => "protocol.ssl",
    };
    let key = |suffix: &str| format!("{prefix}.{suffix}");

    let mut tls = TlsConfig {
        verify_peer: get_bool(app, &key("verify-peer")),
        host: get_str(app, &key("host")).to_owned(),
        certificate_file: get_str(app, &key("certificate-file")).to_owned(),
        certificate_key_file: get_str(app, &key("certificate-key-file")).to_owned(),
        certificate_chain_file: get_str(app, &key("certificate-chain-file")).to_owned(),
        certificate_key_password: get_str(app, &key("certificate-key-password")).to_owned(),
        ciphersuites: get_str(app, &key("ciphersuites")).to_owned(),
    };
    if tls.ciphersuites.is_empty() {
        tls.ciphersuites = DEFAULT_CIPHERSUITES.to_owned();
    }

    match mode {
        Mode::Client => {
            if tls.host.is_empty() && !protocol.uses_websocket() {
                return Err(ConfigError::MissingTlsSetting("protocol.tls.host"));
            }
        }
        Mode::Server => {
            if tls.certificate_file.is_empty() {
                return Err(ConfigError::MissingTlsSetting("protocol.tls.certificate-file"));
            }
            if tls.certificate_key_file.is_empty() {
                return Err(ConfigError::MissingTlsSetting(
                    "protocol.tls.certificate-key-file",
                ));
            }
        }
    }
    Ok(tls)
}

fn load_websocket(app: &Properties) -> Result<WebSocketConfig, ConfigError> {
    let host = get_str(app, "protocol.websocket.host").to_owned();
    if host.is_empty() {
        return Err(ConfigError::MissingWebSocketHost);
    }

    let path = match get_str(app, "protocol.websocket.path") {
        "" => "/".to_owned(),
        path if path.starts_with('/') => path.to_owned(),
        _ => return Err(ConfigError::InvalidWebSocketPath),
    };
    Ok(WebSocketConfig { host, path })
}

/// Parse one mapping section. Sections that do not describe a usable
/// mapping are skipped, not fatal.
fn parse_mapping(name: &str, props: &Properties) -> Option<MappingConfig> {
    let type_str = get_str(props, "type");
    if type_str.is_empty() {
        return None;
    }
    let kind = match type_str.chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('u') | Some('1'..='9') => MappingType::Udp,
        _ => MappingType::Tcp,
    };

    let local_ip = get_str(props, "local-ip").parse::<IpAddr>().ok()?;
    if local_ip.is_multicast() {
        return None;
    }

    let local_port = get_u64(props, "local-port");
    let remote_port = get_u64(props, "remote-port");
    if local_port == 0 || local_port > u16::MAX as u64 {
        return None;
    }
    if remote_port == 0 || remote_port > u16::MAX as u64 {
        return None;
    }

    Some(MappingConfig {
        name: name.to_owned(),
        kind,
        local_ip,
        local_port: local_port as u16,
        remote_port: remote_port as u16,
        concurrent: (get_u64(props, "concurrent") as usize).max(1),
        reconnect: Duration::from_secs(get_u64(props, "reconnect").max(1)),
    })
}
