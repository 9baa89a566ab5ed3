//! Opponent Resolver: one `Opponent` shape for human and AI partners.
//!
//! AI personas are generated once per lobby entry, one per configured model.
//! Model output is frequently not clean JSON, so extraction walks a chain of
//! increasingly lenient strategies before giving up on a model. When nothing
//! usable comes back the fixed personas keep the game playable.

use crate::llm::{ChatTurn, GenerateRequest, LlmManager};
use crate::types::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const CHARACTER_GENERATOR_SYSTEM_PROMPT: &str =
    "You are a character generator. Output only valid JSON.";

pub const UNIFIED_CHARACTER_PROMPT: &str = r#"Generate exactly one character object in valid JSON. Output only pure JSON without any commentary. The format is very strictly enforced.

JSON shape: { "character": { id:number, name:string, avatar:string, status:'online', profile:{ nickname, gender, age, occupation, location, difficulty, interests[], personality, shortTags[] }, systemPrompt:string, starterMessage:string } }

CRITICAL REQUIREMENTS:
1. Avatar: Use ONLY a single emoji (e.g., 🌸, 🎨, 🧑‍💻, ☕, 🚀, 🌟). Never URLs or multiple emojis.
2. Personality: Create a distinct, memorable character. Include human-style details ("usually", "I think") and vivid personal touches that feel authentic. **Your statements should be concise (50-80 characters).**
3. Difficulty: Use 'easy', 'medium', or 'hard'. For 'easy', add more casual anecdotes. For 'hard', be more sophisticated.
4. System Prompt: Write 1-3 paragraphs instructing the AI how to roleplay as this character authentically without revealing AI nature. Include tone, style, verbosity guidelines. **Be concise.**
5. Starter Message: Write 1-2 sentences that match the character's personality. **Be concise.**
6. Names/Tags: Short, chat-friendly keywords. No markdown or special escaping.

Generate a unique, randomized profile each time. Make it feel like a real person with specific interests and quirks. Be creative and diverse in backgrounds, locations, and personalities."#;

const MAX_INTERESTS: usize = 6;
const MAX_SHORT_TAGS: usize = 4;
const DEFAULT_AGE: u32 = 30;
const PERSONA_MAX_TOKENS: u32 = 800;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OpponentError {
    #[error("Session {0} already has a different opponent")]
    AlreadyBound(SessionId),
    #[error("Unknown persona {0}")]
    UnknownPersona(PersonaId),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersonaProfile {
    pub nickname: String,
    pub gender: String,
    pub age: u32,
    pub occupation: String,
    pub location: String,
    pub difficulty: Difficulty,
    pub interests: Vec<String>,
    pub personality: String,
    pub short_tags: Vec<String>,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Persona {
    pub id: PersonaId,
    pub name: String,
    pub avatar: String,
    pub profile: PersonaProfile,
    pub system_prompt: String,
    pub starter_message: String,
    /// `provider:model`, the same id the chat request must carry
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_display_name: Option<String>,
}

fn new_persona_id() -> PersonaId {
    format!("ai_{}", ulid::Ulid::new().to_string().to_lowercase())
}

fn text_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: &Value, key: &str, limit: usize) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|s| !s.is_empty())
                .take(limit)
                .collect()
        })
        .unwrap_or_default()
}

fn age_field(value: &Value) -> u32 {
    let age = match value.get("age") {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    age.filter(|age| *age > 0).unwrap_or(DEFAULT_AGE)
}

/// Human-friendly name for a `provider:model` id
pub fn model_display_name(model_id: &str) -> String {
    let model = model_id
        .split_once(':')
        .map(|(_, model)| model)
        .unwrap_or(model_id);
    match model.split_once('/') {
        Some((org, _)) => org.trim_end_matches("-ai").to_string(),
        None => model.to_string(),
    }
}

impl Persona {
    /// Normalize a generated `{ "character": {...} }` document
    pub fn from_generated(document: &Value, model_id: &str) -> Option<Self> {
        let c = document.get("character")?;
        if !c.is_object() {
            return None;
        }
        let empty = Value::Null;
        let p = c.get("profile").unwrap_or(&empty);
        let display_name = model_display_name(model_id);

        let name = text_field(c, "name")
            .or_else(|| text_field(p, "nickname"))
            .unwrap_or(display_name.as_str())
            .to_string();
        let difficulty = p
            .get("difficulty")
            .cloned()
            .and_then(|d| serde_json::from_value(d).ok())
            .unwrap_or_default();

        let profile = PersonaProfile {
            nickname: text_field(p, "nickname").unwrap_or(name.as_str()).to_string(),
            gender: text_field(p, "gender").unwrap_or("unknown").to_string(),
            age: age_field(p),
            occupation: text_field(p, "occupation").unwrap_or("unknown").to_string(),
            location: text_field(p, "location").unwrap_or("unknown").to_string(),
            difficulty,
            interests: string_list(p, "interests", MAX_INTERESTS),
            personality: text_field(p, "personality").unwrap_or_default().to_string(),
            short_tags: string_list(p, "shortTags", MAX_SHORT_TAGS),
            model_id: model_id.to_string(),
            model_display_name: Some(display_name.clone()),
        };

        Some(Self {
            id: new_persona_id(),
            avatar: pick_emoji(text_field(c, "avatar").unwrap_or_default(), &profile, &name),
            name,
            profile,
            system_prompt: text_field(c, "systemPrompt").unwrap_or_default().to_string(),
            starter_message: text_field(c, "starterMessage").unwrap_or_default().to_string(),
            model_id: model_id.to_string(),
            model_display_name: Some(display_name),
        })
    }
}

/// Best-effort extraction of one JSON object from model output
pub fn extract_json_object(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    if let Some(value) = fenced_block(text).and_then(|b| serde_json::from_str(b).ok()) {
        return Some(value);
    }

    if let Some(candidate) = balanced_object(text) {
        if let Ok(value) = serde_json::from_str(candidate) {
            return Some(value);
        }
        if let Ok(value) = serde_json::from_str(&candidate.replace('\'', "\"")) {
            return Some(value);
        }
    }

    let first = text.find('{')?;
    let last = text.rfind('}')?;
    if last <= first {
        return None;
    }
    serde_json::from_str(&text[first..=last]).ok()
}

/// Body of the first ```json fence that holds an object
fn fenced_block(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body = after
            .strip_prefix("json")
            .or_else(|| after.strip_prefix("JSON"))
            .unwrap_or(after)
            .trim_start();
        let end = body.find("```")?;
        let candidate = body[..end].trim_end();
        if candidate.starts_with('{') && candidate.ends_with('}') {
            return Some(candidate);
        }
        rest = &body[end + 3..];
    }
    None
}

/// From the first `{` to its matching `}`; braces in strings are not special-cased
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

const AVATAR_KEYWORDS: &[(&str, &str)] = &[
    ("creative", "🎨"),
    ("friendly", "😊"),
    ("shy", "🙈"),
    ("ux", "🧑‍💻"),
    ("coffee", "☕"),
    ("data", "📊"),
    ("engineer", "🛠️"),
    ("design", "🎨"),
    ("lily", "🌸"),
    ("mika", "🧑‍💻"),
    ("ari", "🤖"),
];

const AVATAR_FALLBACKS: &[&str] = &["🙂", "😄", "🐎", "☀️", "🌸", "🤖", "🧑‍💻", "🎨", "☕", "🚀"];

fn looks_like_url(s: &str) -> bool {
    let lower = s.to_lowercase();
    lower.starts_with("http")
        || lower.contains("://")
        || lower.contains(".com")
        || [".png", ".jpg", ".jpeg", ".gif", ".svg"]
            .iter()
            .any(|ext| lower.ends_with(ext))
}

fn looks_like_emoji(s: &str) -> bool {
    !s.is_empty()
        && s.chars().count() <= 8
        && !s.chars().any(|c| c.is_ascii_alphanumeric() || c == '.' || c == '/')
}

/// Keep a real emoji avatar, otherwise derive one from tags, interests and name
pub fn pick_emoji(avatar: &str, profile: &PersonaProfile, name: &str) -> String {
    let avatar = avatar.trim();
    if looks_like_emoji(avatar) {
        return avatar.to_string();
    }

    let haystack = format!(
        "{} {} {}",
        profile.short_tags.join(" "),
        profile.interests.join(" "),
        name
    )
    .to_lowercase();
    if let Some((_, emoji)) = AVATAR_KEYWORDS.iter().find(|(k, _)| haystack.contains(k)) {
        return emoji.to_string();
    }

    if looks_like_url(avatar) {
        let idx = rand::rng().random_range(0..AVATAR_FALLBACKS.len());
        return AVATAR_FALLBACKS[idx].to_string();
    }
    "🙂".to_string()
}

/// Personas used whenever generation yields nothing.
///
/// Ids are stable so clients that each fell back agree on who left.
pub fn fallback_personas() -> Vec<Persona> {
    let mika_model = "openai:Qwen/Qwen2.5-7B-Instruct";
    let ari_model = "openai:deepseek-ai/DeepSeek-R1-0528";
    vec![
        Persona {
            id: "ai_fallback_mika".to_string(),
            name: "Mika".to_string(),
            avatar: "🧑‍💻".to_string(),
            profile: PersonaProfile {
                nickname: "Mika".to_string(),
                gender: "female".to_string(),
                age: 28,
                occupation: "UX Designer".to_string(),
                location: "Taipei, Taiwan".to_string(),
                difficulty: Difficulty::Medium,
                interests: vec![
                    "product design".to_string(),
                    "coffee".to_string(),
                    "podcasts".to_string(),
                ],
                personality: "curious, thoughtful, concise".to_string(),
                short_tags: vec!["UX".to_string(), "Taipei".to_string(), "creative".to_string()],
                model_id: mika_model.to_string(),
                model_display_name: Some("Qwen".to_string()),
            },
            system_prompt: "You are Mika, a Taipei-based UX Designer. Roleplay as Mika: be curious, \
                give concise thoughtful replies, occasionally refer to design processes. Avoid \
                revealing you are an AI. Keep replies short (1-3 sentences)."
                .to_string(),
            starter_message: "Hi! I'm Mika. I love talking about product design and coffee. \
                What are you working on these days?"
                .to_string(),
            model_id: mika_model.to_string(),
            model_display_name: Some("Qwen".to_string()),
        },
        Persona {
            id: "ai_fallback_ari".to_string(),
            name: "Ari".to_string(),
            avatar: "🤖".to_string(),
            profile: PersonaProfile {
                nickname: "Ari".to_string(),
                gender: "non-binary".to_string(),
                age: 35,
                occupation: "Data Engineer".to_string(),
                location: "remote".to_string(),
                difficulty: Difficulty::Hard,
                interests: vec![
                    "distributed systems".to_string(),
                    "automation".to_string(),
                    "latency".to_string(),
                ],
                personality: "precise, analytical, minimally verbose".to_string(),
                short_tags: vec!["Data".to_string(), "Engineer".to_string()],
                model_id: ari_model.to_string(),
                model_display_name: Some("DeepSeek".to_string()),
            },
            system_prompt: "You are Ari, a data engineer. Roleplay as Ari: be precise, concise, and \
                technically coherent. Provide clear, factual replies. Avoid unnecessary small talk. \
                Keep responses brief (1-2 sentences)."
                .to_string(),
            starter_message:
                "Hello. I focus on data pipelines and latency optimization. How can I help?"
                    .to_string(),
            model_id: ari_model.to_string(),
            model_display_name: Some("DeepSeek".to_string()),
        },
    ]
}

/// Ask every configured model for one persona; falls back to the fixed set
pub async fn generate_personas(llm: Option<&LlmManager>, timeout: Duration) -> Vec<Persona> {
    let Some(llm) = llm else {
        tracing::warn!("No LLM providers configured, using fallback personas");
        return fallback_personas();
    };

    let mut request = GenerateRequest::new(vec![ChatTurn::user(UNIFIED_CHARACTER_PROMPT)], timeout);
    request.system_prompt = Some(CHARACTER_GENERATOR_SYSTEM_PROMPT.to_string());
    request.temperature = Some(0.7);
    request.max_tokens = Some(PERSONA_MAX_TOKENS);

    let mut seen_models = HashSet::new();
    let personas: Vec<Persona> = llm
        .generate_from_all(request)
        .await
        .into_iter()
        .filter(|(model_id, _)| seen_models.insert(model_id.clone()))
        .filter_map(|(model_id, response)| {
            let persona = extract_json_object(&response.text)
                .and_then(|doc| Persona::from_generated(&doc, &model_id));
            match &persona {
                Some(p) => tracing::info!("[{}] Persona generated: {}", model_id, p.name),
                None => tracing::warn!(
                    "[{}] Failed to parse persona from {} chars of output",
                    model_id,
                    response.text.len()
                ),
            }
            persona
        })
        .collect();

    if personas.is_empty() {
        tracing::warn!("No personas generated, using fallback personas");
        return fallback_personas();
    }
    personas
}

/// The resolved partner of a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opponent {
    Human { member: PresenceMember },
    Ai { persona: Persona },
}

impl Opponent {
    pub fn kind(&self) -> OpponentKind {
        match self {
            Self::Human { .. } => OpponentKind::Human,
            Self::Ai { .. } => OpponentKind::Ai,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Human { member } => &member.name,
            Self::Ai { persona } => &persona.name,
        }
    }

    pub fn model_id(&self) -> Option<&str> {
        match self {
            Self::Human { .. } => None,
            Self::Ai { persona } => Some(&persona.model_id),
        }
    }

    pub fn descriptor(&self) -> OpponentDescriptor {
        match self {
            Self::Human { .. } => OpponentDescriptor::human(),
            Self::Ai { persona } => OpponentDescriptor::ai(persona.model_id.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct OpponentResolver {
    personas: Vec<Persona>,
    loaded: bool,
    bindings: HashMap<SessionId, Opponent>,
}

impl OpponentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver with a known persona set, no generation needed
    pub fn with_personas(personas: Vec<Persona>) -> Self {
        Self {
            personas,
            loaded: true,
            bindings: HashMap::new(),
        }
    }

    /// Fetch personas once per lobby entry
    pub async fn load_personas(&mut self, llm: Option<&LlmManager>, timeout: Duration) -> &[Persona] {
        if !self.loaded {
            self.personas = generate_personas(llm, timeout).await;
            self.loaded = true;
        }
        &self.personas
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn persona(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    /// Remove a persona from the lobby (its session ended somewhere)
    pub fn retire(&mut self, id: &str) -> bool {
        let before = self.personas.len();
        self.personas.retain(|p| p.id != id);
        before != self.personas.len()
    }

    pub fn ai(&self, persona_id: &str) -> Result<Opponent, OpponentError> {
        self.persona(persona_id)
            .cloned()
            .map(|persona| Opponent::Ai { persona })
            .ok_or_else(|| OpponentError::UnknownPersona(persona_id.to_string()))
    }

    pub fn human(member: PresenceMember) -> Opponent {
        Opponent::Human { member }
    }

    /// Fix the opponent of a session. Rebinding the same opponent is a no-op.
    pub fn bind(&mut self, session_id: &str, opponent: Opponent) -> Result<&Opponent, OpponentError> {
        if let Some(existing) = self.bindings.get(session_id) {
            if *existing != opponent {
                return Err(OpponentError::AlreadyBound(session_id.to_string()));
            }
        }
        Ok(self
            .bindings
            .entry(session_id.to_string())
            .or_insert(opponent))
    }

    pub fn opponent(&self, session_id: &str) -> Option<&Opponent> {
        self.bindings.get(session_id)
    }

    pub fn release(&mut self, session_id: &str) -> Option<Opponent> {
        self.bindings.remove(session_id)
    }
}
