//! One player's view of the game: lobby, invites, the active session and its
//! judgment, driven by deliveries from the transport.

use crate::invite::{InvitationCoordinator, InviteError, InviteNotifier, InviteOutcome};
use crate::judgment::{JudgmentError, JudgmentMachine};
use crate::llm::LlmManager;
use crate::opponent::{Opponent, OpponentError, OpponentResolver, Persona};
use crate::presence::PresenceRegistry;
use crate::protocol::{session_channel, session_id_from_channel, ChannelEvent, Delivery, LOBBY_CHANNEL};
use crate::relay::{ChatSettings, MessageRelay, RelayError, RelayUpdate};
use crate::session::{score, SessionRegistry};
use crate::transport::{Inbox, Transport, TransportError};
use crate::types::*;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Invite(#[from] InviteError),
    #[error(transparent)]
    Opponent(#[from] OpponentError),
    #[error(transparent)]
    Judgment(#[from] JudgmentError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("No active session")]
    NoActiveSession,
    #[error("Session {0} is still in progress")]
    SessionInProgress(SessionId),
    #[error("Messages can only be sent while playing, not during {0:?}")]
    NotPlaying(Phase),
}

/// Something the UI should react to
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LobbyChanged(Vec<PresenceMember>),
    Invite(InviteOutcome),
    InvitesExpired(Vec<Invite>),
    SessionStarted {
        session_id: SessionId,
        opponent_kind: OpponentKind,
        opponent_name: String,
    },
    Message {
        session_id: SessionId,
        message: Message,
    },
    PhaseChanged {
        session_id: SessionId,
        phase: Phase,
    },
    PersonaLeft(PersonaId),
}

/// The session currently played, with everything that is local to it
#[derive(Debug)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub opponent: Opponent,
    pub transcript: Vec<Message>,
    pub judgment: JudgmentMachine,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
struct PendingUplink {
    persona_id: PersonaId,
    deadline: Instant,
}

pub struct GameClient {
    transport: Arc<dyn Transport>,
    inbox: Inbox,
    sessions: SessionRegistry,
    rules: GameRules,
    llm: Option<Arc<LlmManager>>,
    settings: ChatSettings,
    presence: PresenceRegistry,
    invites: InvitationCoordinator,
    relay: MessageRelay,
    resolver: OpponentResolver,
    active: Option<ActiveSession>,
    uplink: Option<PendingUplink>,
    updates_tx: mpsc::UnboundedSender<RelayUpdate>,
    updates_rx: Option<mpsc::UnboundedReceiver<RelayUpdate>>,
}

impl GameClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        inbox: Inbox,
        sessions: SessionRegistry,
        rules: GameRules,
    ) -> Self {
        let settings = ChatSettings::default();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            presence: PresenceRegistry::new(Some(transport.clone())),
            invites: InvitationCoordinator::new(transport.clone(), rules.invite_ttl),
            relay: MessageRelay::new(transport.clone(), sessions.clone(), None, settings.clone()),
            resolver: OpponentResolver::new(),
            transport,
            inbox,
            sessions,
            rules,
            llm: None,
            settings,
            active: None,
            uplink: None,
            updates_tx,
            updates_rx: Some(updates_rx),
        }
    }

    /// Enable AI opponents backed by `llm`
    pub fn with_llm(mut self, llm: Arc<LlmManager>, settings: ChatSettings) -> Self {
        self.relay = MessageRelay::new(
            self.transport.clone(),
            self.sessions.clone(),
            Some(llm.clone()),
            settings.clone(),
        );
        self.llm = Some(llm);
        self.settings = settings;
        self
    }

    /// Use a fixed persona set instead of generating one
    pub fn with_personas(mut self, personas: Vec<Persona>) -> Self {
        self.resolver = OpponentResolver::with_personas(personas);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn InviteNotifier>) -> Self {
        self.invites = self.invites.with_notifier(notifier);
        self
    }

    pub fn identity(&self) -> &Identity {
        self.transport.identity()
    }

    pub fn lobby(&self) -> Vec<PresenceMember> {
        self.presence.list()
    }

    pub fn personas(&self) -> &[Persona] {
        self.resolver.personas()
    }

    pub fn invites(&self) -> &InvitationCoordinator {
        &self.invites
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.active.as_ref().map(|a| a.judgment.phase())
    }

    pub fn is_uplinking(&self) -> bool {
        self.uplink.is_some()
    }

    /// Streaming progress of AI replies; can be taken once
    pub fn take_updates(&mut self) -> Option<mpsc::UnboundedReceiver<RelayUpdate>> {
        self.updates_rx.take()
    }

    /// Join the lobby and load the AI personas
    pub async fn enter_lobby(&mut self) -> Result<(), ClientError> {
        self.presence.join().await?;
        let personas = self
            .resolver
            .load_personas(self.llm.as_deref(), self.settings.timeout)
            .await;
        tracing::info!(
            "{} entered the lobby ({} personas available)",
            self.transport.identity().name,
            personas.len()
        );
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), ClientError> {
        match &self.active {
            Some(active) => Err(ClientError::SessionInProgress(active.session_id.clone())),
            None => Ok(()),
        }
    }

    pub async fn invite(&mut self, target: &str) -> Result<Invite, ClientError> {
        self.ensure_idle()?;
        Ok(self.invites.send_invite(target).await?)
    }

    pub fn cancel_invite(&mut self) -> Option<Invite> {
        self.invites.cancel()
    }

    pub fn set_focus(&mut self, focused: bool) -> Option<Invite> {
        self.invites.set_focus(focused).cloned()
    }

    /// Accept a received invite and open the session it names
    pub async fn accept(&mut self, session_id: &str) -> Result<Vec<ClientEvent>, ClientError> {
        self.ensure_idle()?;
        let Some(invite) = self.invites.accept(session_id).await? else {
            return Ok(Vec::new());
        };
        let event = self
            .open_human_session(&invite.session_id, &invite.from_user)
            .await?;
        Ok(vec![event])
    }

    pub async fn reject(&mut self, session_id: &str) -> Result<Invite, ClientError> {
        Ok(self.invites.reject(session_id).await?)
    }

    async fn open_human_session(
        &mut self,
        session_id: &str,
        peer: &str,
    ) -> Result<ClientEvent, ClientError> {
        let member = self
            .presence
            .find(peer)
            .cloned()
            .unwrap_or_else(|| PresenceMember {
                connection_id: String::new(),
                name: peer.to_string(),
                faction: None,
            });
        let opponent = self
            .resolver
            .bind(session_id, OpponentResolver::human(member))?
            .clone();

        self.relay.subscribe(session_id).await?;
        let session = self.sessions.start(session_id, &opponent.descriptor()).await;
        Ok(self.activate(session_id, opponent, Vec::new(), session.start_time))
    }

    fn activate(
        &mut self,
        session_id: &str,
        opponent: Opponent,
        transcript: Vec<Message>,
        started_at: DateTime<Utc>,
    ) -> ClientEvent {
        let event = ClientEvent::SessionStarted {
            session_id: session_id.to_string(),
            opponent_kind: opponent.kind(),
            opponent_name: opponent.name().to_string(),
        };
        self.active = Some(ActiveSession {
            session_id: session_id.to_string(),
            judgment: JudgmentMachine::new(
                opponent.kind(),
                self.rules.judge_threshold,
                self.rules.analysis_delay,
            ),
            opponent,
            transcript,
            started_at,
        });
        tracing::info!("Now playing session {}", session_id);
        event
    }

    /// Arm the local uplink delay before an AI session starts
    pub fn request_ai_session(&mut self, persona_id: &str, now: Instant) -> Result<(), ClientError> {
        self.ensure_idle()?;
        if self.resolver.persona(persona_id).is_none() {
            return Err(OpponentError::UnknownPersona(persona_id.to_string()).into());
        }
        self.uplink = Some(PendingUplink {
            persona_id: persona_id.to_string(),
            deadline: now + self.rules.uplink_delay,
        });
        tracing::debug!("Uplink to {} armed", persona_id);
        Ok(())
    }

    /// Discard a pending AI session start
    pub fn cancel_uplink(&mut self) -> bool {
        self.uplink.take().is_some()
    }

    async fn open_ai_session(&mut self, persona_id: &str) -> Result<ClientEvent, ClientError> {
        let opponent = self.resolver.ai(persona_id)?;
        let session_id = new_session_id("ai");
        self.resolver.bind(&session_id, opponent.clone())?;

        let session = self.sessions.start(&session_id, &opponent.descriptor()).await;
        let transcript = match &opponent {
            Opponent::Ai { persona } if !persona.starter_message.is_empty() => {
                vec![Message::assistant(&persona.name, &persona.starter_message)]
            }
            _ => Vec::new(),
        };
        Ok(self.activate(&session_id, opponent, transcript, session.start_time))
    }

    /// Advance timers: uplink, analysis delay and invite expiry
    pub async fn tick(&mut self, now: Instant) -> Result<Vec<ClientEvent>, ClientError> {
        let mut events = Vec::new();

        let expired = self.invites.expire(Utc::now());
        if !expired.is_empty() {
            events.push(ClientEvent::InvitesExpired(expired));
        }

        if let Some(active) = &mut self.active {
            if let Some(phase) = active.judgment.poll(now) {
                events.push(ClientEvent::PhaseChanged {
                    session_id: active.session_id.clone(),
                    phase,
                });
            }
        }

        if self.uplink.as_ref().is_some_and(|u| now >= u.deadline) {
            if let Some(uplink) = self.uplink.take() {
                events.push(self.open_ai_session(&uplink.persona_id).await?);
            }
        }
        Ok(events)
    }

    /// Send a chat message in the active session
    pub async fn send(&mut self, content: &str) -> Result<Vec<ClientEvent>, ClientError> {
        let active = self.active.as_mut().ok_or(ClientError::NoActiveSession)?;
        let phase = active.judgment.phase();
        if phase != Phase::Playing {
            return Err(ClientError::NotPlaying(phase));
        }
        let session_id = active.session_id.clone();

        let persona = match &active.opponent {
            Opponent::Human { .. } => {
                let message = self.relay.send_human(&session_id, content).await?;
                active.transcript.push(message);
                return Ok(Vec::new());
            }
            Opponent::Ai { persona } => persona.clone(),
        };

        let payload = self
            .relay
            .chat_payload(&session_id, &persona, &active.transcript, content);
        if let Some(user_turn) = payload.user_turn() {
            active.transcript.push(user_turn.clone());
        }

        let mut events = Vec::new();
        match self.relay.send_ai(&payload, &self.updates_tx).await {
            Ok(reply) => {
                active.transcript.push(reply.clone());
                events.push(ClientEvent::Message {
                    session_id: session_id.clone(),
                    message: reply,
                });
                if let Some(step) = active.judgment.record_opponent_message(Instant::now()) {
                    events.push(ClientEvent::PhaseChanged {
                        session_id,
                        phase: step.phase,
                    });
                }
            }
            Err(e) => {
                tracing::warn!("AI reply in {} failed: {}", session_id, e);
                let partial = match &e {
                    RelayError::Generation { partial, .. } if !partial.is_empty() => {
                        Some(Message::assistant(&persona.name, partial))
                    }
                    _ => None,
                };
                let notice = Message::assistant(&persona.name, format!("⚠️ Connection lost: {}", e));
                for message in partial.into_iter().chain(std::iter::once(notice)) {
                    active.transcript.push(message.clone());
                    events.push(ClientEvent::Message {
                        session_id: session_id.clone(),
                        message,
                    });
                }
            }
        }
        Ok(events)
    }

    /// Submit the single guess and score it
    pub async fn submit_guess(&mut self, guess: Guess) -> Result<GuessOutcome, ClientError> {
        let player = self.transport.identity().name.clone();
        let active = self.active.as_mut().ok_or(ClientError::NoActiveSession)?;
        active.judgment.begin_guess(guess)?;

        let decided_at = Utc::now();
        let outcome = match self
            .sessions
            .submit_guess(&active.session_id, &player, guess, decided_at)
            .await
        {
            Some(outcome) => outcome,
            None => {
                tracing::warn!(
                    "Session {} unknown to the registry, scoring locally",
                    active.session_id
                );
                score::compute(
                    active.opponent.kind(),
                    guess,
                    active.started_at,
                    decided_at,
                    active.transcript.len(),
                )
            }
        };
        active.judgment.finish(outcome);
        Ok(outcome)
    }

    /// Tear down the active session and everything local to it
    pub async fn reset(&mut self) -> Result<(), ClientError> {
        self.uplink = None;
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        self.sessions.end(&active.session_id).await;
        self.resolver.release(&active.session_id);
        self.invites.clear_session(&active.session_id);

        match &active.opponent {
            Opponent::Human { .. } => {
                if let Err(e) = self.relay.unsubscribe(&active.session_id).await {
                    tracing::warn!("Failed to leave {}: {}", active.session_id, e);
                }
            }
            Opponent::Ai { persona } => {
                self.resolver.retire(&persona.id);
                let event = ChannelEvent::AiLeft {
                    session_id: active.session_id.clone(),
                    ai_id: persona.id.clone(),
                };
                if self.presence.is_joined() {
                    self.transport.publish(LOBBY_CHANNEL, event).await?;
                }
            }
        }
        tracing::info!("Left session {}", active.session_id);
        Ok(())
    }

    /// Handle everything currently waiting in the inbox
    pub async fn pump(&mut self) -> Result<Vec<ClientEvent>, ClientError> {
        let mut events = Vec::new();
        while let Ok(delivery) = self.inbox.try_recv() {
            events.extend(self.handle_delivery(delivery).await?);
        }
        Ok(events)
    }

    /// Wait for the next delivery and handle it; `None` once disconnected
    pub async fn next(&mut self) -> Option<Result<Vec<ClientEvent>, ClientError>> {
        let delivery = self.inbox.recv().await?;
        Some(self.handle_delivery(delivery).await)
    }

    pub async fn handle_delivery(
        &mut self,
        delivery: Delivery,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        if delivery.channel == LOBBY_CHANNEL {
            return self.handle_lobby_event(&delivery.event).await;
        }
        let Some(session_id) = session_id_from_channel(&delivery.channel) else {
            tracing::debug!("Delivery on unknown channel {}", delivery.channel);
            return Ok(Vec::new());
        };
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|a| a.session_id == session_id);
        if !is_active {
            tracing::debug!("Dropping event for inactive session {}", session_id);
            return Ok(Vec::new());
        }
        self.handle_session_event(&delivery).await
    }

    async fn handle_lobby_event(
        &mut self,
        event: &ChannelEvent,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        if self.presence.apply(event) {
            return Ok(vec![ClientEvent::LobbyChanged(self.presence.list())]);
        }

        if let ChannelEvent::AiLeft { ai_id, .. } = event {
            return Ok(if self.resolver.retire(ai_id) {
                vec![ClientEvent::PersonaLeft(ai_id.clone())]
            } else {
                Vec::new()
            });
        }

        match self.invites.handle_event(event, Utc::now()) {
            InviteOutcome::Ignored => Ok(Vec::new()),
            InviteOutcome::Established { session_id, peer } => {
                if let Some(active) = &self.active {
                    tracing::warn!(
                        "Accept for {} arrived while playing {}",
                        session_id,
                        active.session_id
                    );
                    return Ok(Vec::new());
                }
                let started = self.open_human_session(&session_id, &peer).await?;
                Ok(vec![
                    ClientEvent::Invite(InviteOutcome::Established { session_id, peer }),
                    started,
                ])
            }
            outcome => Ok(vec![ClientEvent::Invite(outcome)]),
        }
    }

    async fn handle_session_event(
        &mut self,
        delivery: &Delivery,
    ) -> Result<Vec<ClientEvent>, ClientError> {
        let mut events = Vec::new();
        let incoming = self.relay.filter_incoming(delivery);
        let Some(active) = self.active.as_mut() else {
            return Ok(events);
        };

        match (&delivery.event, incoming) {
            (ChannelEvent::NewMessage { .. }, Some((session_id, message))) => {
                active.transcript.push(message.clone());
                events.push(ClientEvent::Message {
                    session_id: session_id.clone(),
                    message,
                });
                if let Some(step) = active.judgment.record_opponent_message(Instant::now()) {
                    if step.broadcast {
                        let signal = ChannelEvent::PhaseChange {
                            session_id: session_id.clone(),
                            phase: step.phase,
                        };
                        // The local transition stands even if the partner misses it
                        if let Err(e) = self
                            .transport
                            .publish(&session_channel(&session_id), signal)
                            .await
                        {
                            tracing::warn!("Failed to announce phase in {}: {}", session_id, e);
                        }
                    }
                    events.push(ClientEvent::PhaseChanged {
                        session_id,
                        phase: step.phase,
                    });
                }
            }
            (ChannelEvent::PhaseChange { session_id, phase }, _) => {
                if active.judgment.apply_remote_phase(*phase) {
                    events.push(ClientEvent::PhaseChanged {
                        session_id: session_id.clone(),
                        phase: *phase,
                    });
                }
            }
            _ => {}
        }
        Ok(events)
    }

    /// Swap in a fresh connection, rejoining the lobby and the active session
    pub async fn reconnect(
        &mut self,
        transport: Arc<dyn Transport>,
        inbox: Inbox,
    ) -> Result<(), ClientError> {
        self.transport.disconnect().await;

        self.presence = PresenceRegistry::new(Some(transport.clone()));
        self.invites = InvitationCoordinator::new(transport.clone(), self.rules.invite_ttl);
        self.relay = MessageRelay::new(
            transport.clone(),
            self.sessions.clone(),
            self.llm.clone(),
            self.settings.clone(),
        );
        self.transport = transport;
        self.inbox = inbox;

        self.presence.join().await?;
        if let Some(active) = &self.active {
            if active.opponent.kind() == OpponentKind::Human {
                self.relay.subscribe(&active.session_id).await?;
            }
        }
        tracing::info!("Reconnected as {}", self.transport.identity().connection_id);
        Ok(())
    }

    /// Leave the lobby and drop the connection
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.presence.leave().await {
            tracing::debug!("Leaving the lobby failed: {}", e);
        }
        self.transport.disconnect().await;
    }
}
