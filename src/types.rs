use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque ID types for type safety
pub type SessionId = String;
pub type ConnectionId = String;
pub type PersonaId = String;

/// Charset for the random suffix of generated session ids
const SUFFIX_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LENGTH: usize = 9;

/// Generate a session id of the form `<prefix>_<unix millis>_<random base36>`.
///
/// Ids are generated by the caller (the inviter, or the AI-session starter) so
/// both parties of a human match can agree on the channel before any server
/// state exists.
pub fn new_session_id(prefix: &str) -> SessionId {
    let mut rng = rand::rng();
    let suffix: String = (0..SUFFIX_LENGTH)
        .map(|_| SUFFIX_CHARS[rng.random_range(0..SUFFIX_CHARS.len())] as char)
        .collect();
    format!("{}_{}_{}", prefix, Utc::now().timestamp_millis(), suffix)
}

/// Cosmetic faction tag carried as presence metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Faction {
    Human,
    Machine,
    Neutral,
}

/// An ephemeral, unauthenticated display name bound to one transport connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub name: String,
    pub connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction: Option<Faction>,
}

impl Identity {
    pub fn member(&self) -> PresenceMember {
        PresenceMember {
            connection_id: self.connection_id.clone(),
            name: self.name.clone(),
            faction: self.faction.clone(),
        }
    }
}

/// A live lobby entry derived from a connected identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PresenceMember {
    pub connection_id: ConnectionId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faction: Option<Faction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invite {
    pub from_user: String,
    pub target_user: String,
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
}

impl Invite {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.created_at > ttl,
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpponentKind {
    Human,
    Ai,
}

/// A player's verdict about the opponent; same vocabulary as the opponent kind
pub type Guess = OpponentKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub sender: String,
    pub content: String,
    pub role: MessageRole,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            role: MessageRole::User,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            role: MessageRole::Assistant,
            timestamp: Utc::now(),
        }
    }
}

/// What the session starter knows about the opponent when creating a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpponentDescriptor {
    #[serde(rename = "type")]
    pub kind: OpponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

impl OpponentDescriptor {
    pub fn human() -> Self {
        Self {
            kind: OpponentKind::Human,
            model_id: None,
        }
    }

    pub fn ai(model_id: impl Into<String>) -> Self {
        Self {
            kind: OpponentKind::Ai,
            model_id: Some(model_id.into()),
        }
    }
}

/// One participant's judgment recorded on a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuessRecord {
    /// Display name of the judging participant
    #[serde(default)]
    pub player: String,
    pub player_guess: Guess,
    pub is_correct: bool,
    pub decision_time: DateTime<Utc>,
    pub score: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuessOutcome {
    pub is_correct: bool,
    pub score: u32,
}

impl From<&GuessRecord> for GuessOutcome {
    fn from(r: &GuessRecord) -> Self {
        Self {
            is_correct: r.is_correct,
            score: r.score,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub opponent_kind: OpponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// At most one entry per participant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guesses: Vec<GuessRecord>,
}

impl Session {
    /// A fresh active session as it looks right after insert
    pub fn new(session_id: SessionId, opponent: &OpponentDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            status: SessionStatus::Active,
            start_time: now,
            opponent_kind: opponent.kind,
            model_id: match opponent.kind {
                OpponentKind::Ai => opponent.model_id.clone(),
                OpponentKind::Human => None,
            },
            messages: Vec::new(),
            guesses: Vec::new(),
        }
    }

    pub fn guess_of(&self, player: &str) -> Option<&GuessRecord> {
        self.guesses.iter().find(|g| g.player == player)
    }
}

/// Phases of one judged round, as seen by one participant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Playing,
    Analyzing,
    Judging,
    /// Terminal phase, serialized as `result`
    #[serde(rename = "result")]
    Outcome,
}

/// Tunable game constants
#[derive(Debug, Clone, PartialEq)]
pub struct GameRules {
    /// Opponent-authored messages needed before leaving `playing`
    pub judge_threshold: u32,
    /// Synthetic `analyzing` delay for AI opponents
    pub analysis_delay: Duration,
    /// Local handshake delay before an AI session starts
    pub uplink_delay: Duration,
    /// Lifetime of an outstanding invite (both sides)
    pub invite_ttl: Duration,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            judge_threshold: 5,
            analysis_delay: Duration::from_millis(3000),
            uplink_delay: Duration::from_millis(1500),
            invite_ttl: Duration::from_secs(120),
        }
    }
}

impl GameRules {
    /// Load rules from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            judge_threshold: env_parse("JUDGE_THRESHOLD")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.judge_threshold),
            analysis_delay: env_parse("ANALYSIS_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.analysis_delay),
            uplink_delay: env_parse("UPLINK_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.uplink_delay),
            invite_ttl: env_parse("INVITE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.invite_ttl),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
