use crate::collectors::ProbeReadings;
use crate::control::ServerAction;
use crate::state::{ResourceUsage, StatusSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub reachable: bool,
    pub process_live: bool,
    pub session_live: bool,
    pub port_open: bool,
    pub occupants: Vec<String>,
    pub occupant_count: usize,
    pub capacity: u32,
    pub uptime_seconds: u64,
    pub resource: ResourceUsage,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerList {
    pub online: usize,
    pub max: u32,
    pub list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    StatusUpdate { data: StatusData },
    Logs { data: String },
    Connected { message: String },
    Error { message: String },
    Success { message: String },
    PlayerList { data: PlayerList },
    Notification { message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    RequestStatus,
    RequestPlayers,
    Command { command: String },
    StartServer,
    StopServer,
    RestartServer,
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("некорректное входящее сообщение: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SnapshotDecodeError {
    #[error("некорректная метка времени '{value}': {source}")]
    Timestamp {
        value: String,
        source: humantime::TimestampError,
    },
    #[error("occupantCount={count} не совпадает с длиной occupants={len}")]
    OccupantCount { count: usize, len: usize },
    #[error("occupants содержит повторяющееся имя '{0}'")]
    DuplicateOccupant(String),
    #[error("reachable не согласован с processLive и portOpen")]
    Reachable,
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusUpdate { .. } => "status_update",
            Self::Logs { .. } => "logs",
            Self::Connected { .. } => "connected",
            Self::Error { .. } => "error",
            Self::Success { .. } => "success",
            Self::PlayerList { .. } => "player_list",
            Self::Notification { .. } => "notification",
        }
    }

    pub fn status(snapshot: &StatusSnapshot) -> Self {
        Self::StatusUpdate {
            data: StatusData::from(snapshot),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.to_string())
    }
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn server_action(&self) -> Option<ServerAction> {
        match self {
            Self::StartServer => Some(ServerAction::Start),
            Self::StopServer => Some(ServerAction::Stop),
            Self::RestartServer => Some(ServerAction::Restart),
            _ => None,
        }
    }
}

impl From<&StatusSnapshot> for StatusData {
    fn from(value: &StatusSnapshot) -> Self {
        Self {
            reachable: value.reachable(),
            process_live: value.process_live(),
            session_live: value.session_live(),
            port_open: value.port_open(),
            occupants: value.occupants().to_vec(),
            occupant_count: value.occupant_count(),
            capacity: value.capacity(),
            uptime_seconds: value.uptime_seconds(),
            resource: value.resource(),
            timestamp: humantime::format_rfc3339_millis(value.taken_at()).to_string(),
        }
    }
}

impl From<&StatusSnapshot> for PlayerList {
    fn from(value: &StatusSnapshot) -> Self {
        Self {
            online: value.occupant_count(),
            max: value.capacity(),
            list: value.occupants().to_vec(),
        }
    }
}

impl TryFrom<StatusData> for StatusSnapshot {
    type Error = SnapshotDecodeError;

    fn try_from(value: StatusData) -> Result<Self, Self::Error> {
        if value.occupant_count != value.occupants.len() {
            return Err(SnapshotDecodeError::OccupantCount {
                count: value.occupant_count,
                len: value.occupants.len(),
            });
        }
        for (idx, name) in value.occupants.iter().enumerate() {
            if value.occupants[..idx].contains(name) {
                return Err(SnapshotDecodeError::DuplicateOccupant(name.clone()));
            }
        }
        if value.reachable != (value.process_live && value.port_open) {
            return Err(SnapshotDecodeError::Reachable);
        }
        let taken_at = humantime::parse_rfc3339(&value.timestamp).map_err(|source| {
            SnapshotDecodeError::Timestamp {
                value: value.timestamp.clone(),
                source,
            }
        })?;

        Ok(StatusSnapshot::new(
            ProbeReadings {
                process_live: value.process_live,
                session_live: value.session_live,
                port_open: value.port_open,
                resource: value.resource,
                uptime_seconds: value.uptime_seconds,
                occupants: value.occupants,
            },
            value.capacity,
            taken_at,
        ))
    }
}
