use crate::collectors::occupancy::EventPatterns;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub probes: ProbeConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub hardcopy_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OccupancyMode {
    #[default]
    SetDifference,
    SessionPaired,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_occupancy_tail_lines")]
    pub occupancy_tail_lines: usize,
    #[serde(default)]
    pub occupancy_mode: OccupancyMode,
    #[serde(default = "default_connect_marker")]
    pub connect_marker: String,
    #[serde(default = "default_disconnect_marker")]
    pub disconnect_marker: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    #[serde(default = "default_privileged_interval_secs")]
    pub privileged_interval_secs: u64,
    #[serde(default = "default_privileged_tail_lines")]
    pub privileged_tail_lines: usize,
    #[serde(default = "default_command_tail_lines")]
    pub command_tail_lines: usize,
    #[serde(default = "default_command_tail_delay_ms")]
    pub command_tail_delay_ms: u64,
    #[serde(default = "default_privileged_path_marker")]
    pub privileged_path_marker: String,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_probe_on_read")]
    pub probe_on_read: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_launch_command")]
    pub launch_command: String,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    #[serde(default = "default_session_settle_ms")]
    pub session_settle_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_stop_refresh_delay_ms")]
    pub stop_refresh_delay_ms: u64,
    #[serde(default = "default_restart_refresh_delay_ms")]
    pub restart_refresh_delay_ms: u64,
    #[serde(default = "default_log_lines")]
    pub log_lines: usize,
    #[serde(default = "default_quick_commands")]
    pub quick_commands: Vec<QuickCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct QuickCommand {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            session_name: default_session_name(),
            port: default_port(),
            capacity: default_capacity(),
            hardcopy_path: None,
        }
    }
}

impl ServerConfig {
    pub fn hardcopy_path(&self) -> String {
        self.hardcopy_path
            .clone()
            .unwrap_or_else(|| format!("/tmp/screen-{}.log", self.session_name))
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            occupancy_tail_lines: default_occupancy_tail_lines(),
            occupancy_mode: OccupancyMode::default(),
            connect_marker: default_connect_marker(),
            disconnect_marker: default_disconnect_marker(),
        }
    }
}

impl ProbeConfig {
    pub fn event_patterns(&self) -> Result<EventPatterns, ConfigError> {
        EventPatterns::new(&self.connect_marker, &self.disconnect_marker).map_err(|err| {
            ConfigError::Validation(format!(
                "не удалось собрать шаблоны probes.*_marker: {err}"
            ))
        })
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: default_status_interval_secs(),
            privileged_interval_secs: default_privileged_interval_secs(),
            privileged_tail_lines: default_privileged_tail_lines(),
            command_tail_lines: default_command_tail_lines(),
            command_tail_delay_ms: default_command_tail_delay_ms(),
            privileged_path_marker: default_privileged_path_marker(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            launch_command: default_launch_command(),
            stop_command: default_stop_command(),
            session_settle_ms: default_session_settle_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            stop_refresh_delay_ms: default_stop_refresh_delay_ms(),
            restart_refresh_delay_ms: default_restart_refresh_delay_ms(),
            log_lines: default_log_lines(),
            quick_commands: default_quick_commands(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            probe_on_read: default_probe_on_read(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }

        validate_server(&self.server)?;
        validate_probes(&self.probes)?;
        validate_broadcast(&self.broadcast)?;
        validate_control(&self.control)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_server(cfg: &ServerConfig) -> Result<(), ConfigError> {
    if cfg.process_name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "server.process_name не должен быть пустым".to_string(),
        ));
    }
    if cfg.session_name.trim().is_empty() {
        return Err(ConfigError::Validation(
            "server.session_name не должен быть пустым".to_string(),
        ));
    }
    if cfg.session_name.chars().any(|c| c.is_whitespace() || c == '.') {
        return Err(ConfigError::Validation(format!(
            "server.session_name '{}' не должен содержать пробелы и точки",
            cfg.session_name
        )));
    }
    if cfg.port == 0 {
        return Err(ConfigError::Validation(
            "server.port должен быть в диапазоне 1..65535".to_string(),
        ));
    }
    if let Some(path) = &cfg.hardcopy_path {
        if path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.hardcopy_path не должен быть пустым".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_probes(cfg: &ProbeConfig) -> Result<(), ConfigError> {
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "probes.timeout_ms должен быть > 0".to_string(),
        ));
    }
    if cfg.occupancy_tail_lines == 0 {
        return Err(ConfigError::Validation(
            "probes.occupancy_tail_lines должно быть >= 1".to_string(),
        ));
    }
    if cfg.connect_marker.is_empty() || cfg.disconnect_marker.is_empty() {
        return Err(ConfigError::Validation(
            "probes.connect_marker и probes.disconnect_marker не должны быть пустыми".to_string(),
        ));
    }
    if cfg.connect_marker == cfg.disconnect_marker {
        return Err(ConfigError::Validation(
            "probes.connect_marker и probes.disconnect_marker должны различаться".to_string(),
        ));
    }
    cfg.event_patterns()?;
    Ok(())
}

fn validate_broadcast(cfg: &BroadcastConfig) -> Result<(), ConfigError> {
    if cfg.status_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "broadcast.status_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.privileged_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "broadcast.privileged_interval_secs должно быть >= 1".to_string(),
        ));
    }
    if cfg.privileged_tail_lines == 0 || cfg.command_tail_lines == 0 {
        return Err(ConfigError::Validation(
            "broadcast.*_tail_lines должно быть >= 1".to_string(),
        ));
    }
    if cfg.privileged_path_marker.trim().is_empty() {
        return Err(ConfigError::Validation(
            "broadcast.privileged_path_marker не должен быть пустым".to_string(),
        ));
    }
    if cfg.subscriber_queue == 0 {
        return Err(ConfigError::Validation(
            "broadcast.subscriber_queue должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_control(cfg: &ControlConfig) -> Result<(), ConfigError> {
    for (field, value) in [
        ("control.launch_command", &cfg.launch_command),
        ("control.stop_command", &cfg.stop_command),
    ] {
        if value.trim().is_empty() || value.chars().any(|c| c.is_control()) {
            return Err(ConfigError::Validation(format!(
                "{field} не должна быть пустой или содержать управляющие символы"
            )));
        }
    }
    if cfg.log_lines == 0 {
        return Err(ConfigError::Validation(
            "control.log_lines должно быть >= 1".to_string(),
        ));
    }
    for quick in &cfg.quick_commands {
        if quick.name.trim().is_empty() || quick.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "control.quick_commands: name и command не должны быть пустыми".to_string(),
            ));
        }
        if quick.command.chars().any(|c| c.is_control()) {
            return Err(ConfigError::Validation(format!(
                "control.quick_commands: команда '{}' содержит управляющие символы",
                quick.name
            )));
        }
    }
    Ok(())
}

fn default_process_name() -> String {
    "bedrock_server".to_string()
}

fn default_session_name() -> String {
    "tama".to_string()
}

const fn default_port() -> u16 {
    4096
}

const fn default_capacity() -> u32 {
    10
}

const fn default_probe_timeout_ms() -> u64 {
    2000
}

const fn default_occupancy_tail_lines() -> usize {
    200
}

fn default_connect_marker() -> String {
    "Player connected: ".to_string()
}

fn default_disconnect_marker() -> String {
    "Player disconnected: ".to_string()
}

const fn default_status_interval_secs() -> u64 {
    3
}

const fn default_privileged_interval_secs() -> u64 {
    5
}

const fn default_privileged_tail_lines() -> usize {
    20
}

const fn default_command_tail_lines() -> usize {
    50
}

const fn default_command_tail_delay_ms() -> u64 {
    500
}

fn default_privileged_path_marker() -> String {
    "admin".to_string()
}

const fn default_subscriber_queue() -> usize {
    64
}

fn default_launch_command() -> String {
    "cd ~/tama/bedrock-server && ./bedrock_server".to_string()
}

fn default_stop_command() -> String {
    "stop".to_string()
}

const fn default_session_settle_ms() -> u64 {
    1000
}

const fn default_restart_delay_ms() -> u64 {
    5000
}

const fn default_stop_refresh_delay_ms() -> u64 {
    2000
}

const fn default_restart_refresh_delay_ms() -> u64 {
    5000
}

const fn default_log_lines() -> usize {
    100
}

fn default_quick_commands() -> Vec<QuickCommand> {
    [
        ("Clear weather", "weather clear", "☀️"),
        ("Rain", "weather rain", "🌧️"),
        ("Daytime", "time set day", "🌞"),
        ("Night", "time set night", "🌙"),
        ("Remove mobs", "kill @e[type=!player]", "💀"),
        ("Heal everyone", "effect @a regeneration 10 255", "❤️"),
        ("Survival mode", "gamemode survival @a", "⚔️"),
        ("Creative mode", "gamemode creative @a", "🏗️"),
    ]
    .into_iter()
    .map(|(name, command, icon)| QuickCommand {
        name: name.to_string(),
        command: command.to_string(),
        icon: Some(icon.to_string()),
    })
    .collect()
}

const fn default_probe_on_read() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:3000".to_string(),
            server: ServerConfig::default(),
            probes: ProbeConfig::default(),
            broadcast: BroadcastConfig::default(),
            http: HttpConfig::default(),
            control: ControlConfig::default(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        valid_config()
            .validate()
            .expect("конфигурация по умолчанию должна проходить валидацию");
    }

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("разбор примера");
        cfg.validate().expect("пример должен проходить валидацию");
        assert_eq!(cfg.broadcast.status_interval_secs, 3);
        assert_eq!(cfg.broadcast.privileged_interval_secs, 5);
        assert_eq!(cfg.probes.occupancy_mode, OccupancyMode::SetDifference);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("listen: \"0.0.0.0:3000\"\n").expect("разбор");
        assert_eq!(cfg.server.process_name, "bedrock_server");
        assert_eq!(cfg.server.capacity, 10);
        assert_eq!(cfg.server.hardcopy_path(), "/tmp/screen-tama.log");
        assert_eq!(cfg.probes.occupancy_tail_lines, 200);
        assert!(cfg.http.probe_on_read);
        assert_eq!(cfg.control.stop_command, "stop");
        assert_eq!(cfg.control.restart_delay_ms, 5000);
        assert_eq!(cfg.control.quick_commands.len(), 8);
    }

    #[test]
    fn occupancy_mode_parses_snake_case() {
        let cfg: Config = serde_yaml::from_str(
            "listen: \"0.0.0.0:3000\"\nprobes:\n  occupancy_mode: session_paired\n",
        )
        .expect("разбор");
        assert_eq!(cfg.probes.occupancy_mode, OccupancyMode::SessionPaired);
    }

    #[test]
    fn rejects_bad_listen_and_zero_values() {
        let mut cfg = valid_config();
        cfg.listen = "localhost".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = valid_config();
        cfg.probes.timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.broadcast.status_interval_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_session_name_with_dot() {
        let mut cfg = valid_config();
        cfg.server.session_name = "my.session".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_identical_markers() {
        let mut cfg = valid_config();
        cfg.probes.disconnect_marker = cfg.probes.connect_marker.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn markers_with_pattern_metacharacters_are_accepted() {
        let mut cfg = valid_config();
        cfg.probes.connect_marker = "joined (".to_string();
        cfg.probes.disconnect_marker = "left [".to_string();
        cfg.validate().expect("маркеры экранируются");
    }

    #[test]
    fn rejects_bad_control_settings() {
        let mut cfg = valid_config();
        cfg.control.launch_command = "   ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.control.stop_command = "stop\nop Steve".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = valid_config();
        cfg.control.quick_commands.push(QuickCommand {
            name: "".to_string(),
            command: "say hi".to_string(),
            icon: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn quick_commands_parse_without_icon() {
        let cfg: Config = serde_yaml::from_str(
            "listen: \"0.0.0.0:3000\"\ncontrol:\n  quick_commands:\n    - name: Day\n      command: time set day\n",
        )
        .expect("разбор");
        assert_eq!(
            cfg.control.quick_commands,
            vec![QuickCommand {
                name: "Day".to_string(),
                command: "time set day".to_string(),
                icon: None,
            }]
        );
        assert_eq!(cfg.control.log_lines, 100);
    }
}
