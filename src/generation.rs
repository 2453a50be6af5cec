//! Per-conversation streaming generation.
//!
//! At most one generation runs per conversation. A new `send` cancels the one
//! in flight and waits until it has released its slot and engine lease before
//! appending anything, so the transcript never interleaves two replies.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::database::{Database, Message, Role};
use crate::engine::{GenerationRequest, GenerationSettings};
use crate::engine_cache::EngineCache;
use crate::error::{EngineLoadError, GenerationError};
use crate::manifest::ManifestStore;

pub const CANCEL_MARKER: &str = " [Cancelled]";
pub const MAX_PROMPT_CHARS: usize = 50_000;
pub const MAX_TOKENS_LIMIT: i32 = 4096;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Completed,
    Cancelled,
    ModelNotDownloaded,
    EngineUnavailable(EngineLoadError),
    /// The conversation or reply was deleted while streaming.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Token {
        conversation_id: String,
        message_id: String,
        text: String,
    },
    Finished {
        conversation_id: String,
        outcome: Result<SendOutcome, GenerationError>,
    },
}

/// Rejects requests before any message is written or engine touched.
pub fn validate_request(
    prompt: &str,
    settings: &GenerationSettings,
) -> Result<(), GenerationError> {
    if prompt.trim().is_empty() {
        return Err(GenerationError::EmptyPrompt);
    }
    if !(1..=MAX_TOKENS_LIMIT).contains(&settings.max_tokens) {
        return Err(GenerationError::TokenLimit(settings.max_tokens));
    }
    let chars = prompt.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(GenerationError::PromptTooLong(chars));
    }
    Ok(())
}

/// System prompt, a blank line, then `User:`/`Assistant:` turns ending with an
/// open `Assistant:` turn. Error notices and empty turns are left out.
pub fn build_prompt(system_prompt: &str, history: &[Message]) -> String {
    let mut out = String::new();
    let system = system_prompt.trim();
    if !system.is_empty() {
        out.push_str(system);
        out.push_str("\n\n");
    }
    for message in history {
        if message.is_error || message.text.trim().is_empty() {
            continue;
        }
        let speaker = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => continue,
        };
        out.push_str(speaker);
        out.push_str(": ");
        out.push_str(message.text.trim());
        out.push('\n');
    }
    out.push_str("Assistant:");
    out
}

struct Slot {
    generation_id: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Frees the conversation's slot on every exit path.
struct SlotGuard<'a> {
    active: &'a Mutex<HashMap<String, Slot>>,
    conversation_id: String,
    generation_id: u64,
    done: CancellationToken,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if active.get(&self.conversation_id).map(|s| s.generation_id) == Some(self.generation_id) {
            active.remove(&self.conversation_id);
        }
        drop(active);
        self.done.cancel();
    }
}

pub struct GenerationOrchestrator {
    db: Arc<Database>,
    manifest: Arc<ManifestStore>,
    cache: Arc<EngineCache>,
    history_window: usize,
    active: Mutex<HashMap<String, Slot>>,
    next_generation: AtomicU64,
    events: broadcast::Sender<GenerationEvent>,
}

impl GenerationOrchestrator {
    pub fn new(
        db: Arc<Database>,
        manifest: Arc<ManifestStore>,
        cache: Arc<EngineCache>,
        history_window: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            manifest,
            cache,
            history_window: history_window.max(1),
            active: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.events.subscribe()
    }

    pub fn is_generating(&self, conversation_id: &str) -> bool {
        self.active.lock().contains_key(conversation_id)
    }

    /// Ask the running generation to stop. It appends the cancel marker itself.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match self.active.lock().get(conversation_id) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Append `prompt` and stream the model's reply into the conversation.
    ///
    /// Model and engine problems end up as an assistant error message and an
    /// `Ok` outcome. `Err` is reserved for invalid requests and failures of the
    /// token stream itself.
    pub async fn send(
        &self,
        conversation_id: &str,
        prompt: &str,
        model_id: &str,
        settings: &GenerationSettings,
    ) -> Result<SendOutcome, GenerationError> {
        let result = self
            .send_in_slot(conversation_id, prompt, model_id, settings)
            .await;

        match &result {
            Ok(outcome) => log::info!("[generation] {} finished: {:?}", conversation_id, outcome),
            Err(e) => log::warn!("[generation] {} failed: {}", conversation_id, e),
        }
        let _ = self.events.send(GenerationEvent::Finished {
            conversation_id: conversation_id.to_string(),
            outcome: result.clone(),
        });
        result
    }

    /// Every return path here is followed by a `Finished` event in `send`.
    async fn send_in_slot(
        &self,
        conversation_id: &str,
        prompt: &str,
        model_id: &str,
        settings: &GenerationSettings,
    ) -> Result<SendOutcome, GenerationError> {
        validate_request(prompt, settings)?;
        if self.db.conversation(conversation_id)?.is_none() {
            return Err(GenerationError::ConversationNotFound(conversation_id.to_string()));
        }

        let (_guard, cancel) = self.claim(conversation_id).await;
        self.run(conversation_id, prompt, model_id, settings, &cancel)
            .await
    }

    /// Take the conversation's slot, cancelling and awaiting whoever holds it.
    async fn claim(&self, conversation_id: &str) -> (SlotGuard<'_>, CancellationToken) {
        loop {
            let holder = {
                let mut active = self.active.lock();
                match active.get(conversation_id) {
                    Some(slot) => {
                        slot.cancel.cancel();
                        slot.done.clone()
                    }
                    None => {
                        let generation_id = self.next_generation.fetch_add(1, Ordering::Relaxed);
                        let cancel = CancellationToken::new();
                        let done = CancellationToken::new();
                        active.insert(
                            conversation_id.to_string(),
                            Slot {
                                generation_id,
                                cancel: cancel.clone(),
                                done: done.clone(),
                            },
                        );
                        let guard = SlotGuard {
                            active: &self.active,
                            conversation_id: conversation_id.to_string(),
                            generation_id,
                            done,
                        };
                        return (guard, cancel);
                    }
                }
            };
            log::info!("[generation] {} waiting for previous generation", conversation_id);
            holder.cancelled().await;
        }
    }

    async fn run(
        &self,
        conversation_id: &str,
        prompt: &str,
        model_id: &str,
        settings: &GenerationSettings,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, GenerationError> {
        if self
            .db
            .append_message(conversation_id, Role::User, prompt, false)?
            .is_none()
        {
            return Err(GenerationError::ConversationNotFound(conversation_id.to_string()));
        }
        let Some(reply) = self
            .db
            .append_message(conversation_id, Role::Assistant, "", false)?
        else {
            return Ok(SendOutcome::Abandoned);
        };

        let entry = match self.manifest.resolve(model_id) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("[generation] {}", e);
                self.db.replace_message_text(&reply.id, &e.to_string(), true)?;
                return Ok(SendOutcome::ModelNotDownloaded);
            }
        };

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = self.cache.acquire(&entry.local_path) => Some(acquired),
        };
        let lease = match acquired {
            None => return self.mark_cancelled(&reply.id),
            Some(Ok(lease)) => lease,
            Some(Err(e)) => {
                log::warn!("[generation] engine for {} unavailable: {}", model_id, e);
                self.db.replace_message_text(&reply.id, &e.to_string(), true)?;
                return Ok(SendOutcome::EngineUnavailable(e));
            }
        };

        let history: Vec<Message> = self
            .db
            .recent_messages(conversation_id, self.history_window + 1)?
            .into_iter()
            .filter(|m| m.id != reply.id)
            .collect();
        let window = &history[history.len().saturating_sub(self.history_window)..];
        let request = GenerationRequest {
            prompt: build_prompt(&settings.system_prompt, window),
            settings: settings.clone(),
        };

        let mut tokens = lease.stream(request);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = tokens.next() => Some(next),
            };
            let Some(next) = next else {
                drop(tokens);
                return self.mark_cancelled(&reply.id);
            };
            match next {
                None => return Ok(SendOutcome::Completed),
                Some(Ok(text)) => {
                    if !self.db.append_to_message(&reply.id, &text)? {
                        log::info!(
                            "[generation] {} deleted mid-stream, dropping output",
                            conversation_id
                        );
                        return Ok(SendOutcome::Abandoned);
                    }
                    let _ = self.events.send(GenerationEvent::Token {
                        conversation_id: conversation_id.to_string(),
                        message_id: reply.id.clone(),
                        text,
                    });
                }
                Some(Err(e)) => {
                    drop(tokens);
                    self.db
                        .append_message(conversation_id, Role::Assistant, &e.to_string(), true)?;
                    return Err(e);
                }
            }
        }
    }

    fn mark_cancelled(&self, reply_id: &str) -> Result<SendOutcome, GenerationError> {
        if self.db.append_to_message(reply_id, CANCEL_MARKER)? {
            Ok(SendOutcome::Cancelled)
        } else {
            Ok(SendOutcome::Abandoned)
        }
    }
}
