//! Conversation directory - batched listing, dedup and create-or-get
//!
//! Listing costs a fixed number of store round trips regardless of how many conversations
//! the identity has: memberships, then one batch each for conversation rows, participants
//! and profiles. Two stored rows with the same participant set are collapsed into the one
//! with the most recent activity (the smaller id on a tie), which is also how a duplicate created by two concurrent
//! [`ConversationDirectory::create_or_get`] calls disappears from the list.

use chrono::{DateTime, Utc};
use foundit_store::{ChatStore, ParticipantRow};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{ChatError, ChatResult};
use crate::models::{canonical_key, Conversation, Member};

pub struct ConversationDirectory {
    store: Arc<dyn ChatStore>,
}

impl ConversationDirectory {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Conversations of `me`, one per participant set, most recent activity first
    #[instrument(skip(self))]
    pub async fn list(&self, me: &str) -> ChatResult<Vec<Conversation>> {
        let memberships = self.store.memberships(me).await?;
        if memberships.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = memberships
            .iter()
            .map(|m| m.conversation_id.clone())
            .collect();

        let rows = self.store.conversations_by_ids(&ids).await?;
        let participants = self.store.participants_in(&ids).await?;

        let user_ids: Vec<String> = participants
            .iter()
            .map(|p| p.user_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let profiles: HashMap<String, _> = self
            .store
            .profiles_by_ids(&user_ids)
            .await?
            .into_iter()
            .map(|p| (p.user_id.clone(), p))
            .collect();

        let mut by_conversation: HashMap<&str, Vec<&ParticipantRow>> = HashMap::new();
        for participant in &participants {
            by_conversation
                .entry(participant.conversation_id.as_str())
                .or_default()
                .push(participant);
        }

        let mut assembled = Vec::with_capacity(rows.len());
        for row in rows {
            let mut members: Vec<Member> = by_conversation
                .get(row.id.as_str())
                .map(|ps| {
                    ps.iter()
                        .map(|p| {
                            let profile = profiles.get(&p.user_id);
                            Member {
                                user_id: p.user_id.clone(),
                                display_name: profile.map(|pr| pr.display_name.clone()),
                                avatar_url: profile.and_then(|pr| pr.avatar_url.clone()),
                                last_read_at: p.last_read_at,
                            }
                        })
                        .collect()
                })
                .unwrap_or_default();
            members.sort_by(|a, b| a.user_id.cmp(&b.user_id));

            let my_last_read_at = members
                .iter()
                .find(|m| m.user_id == me)
                .and_then(|m| m.last_read_at);

            let mut conversation = Conversation {
                id: row.id,
                created_at: row.created_at,
                last_message_at: row.last_message_at,
                last_message: row.last_message,
                last_message_sender_id: row.last_message_sender_id,
                participants: members,
                my_last_read_at,
                unread: false,
            };
            conversation.unread = conversation.compute_unread();
            assembled.push(conversation);
        }

        let listed = dedup_by_participants(assembled);
        debug!("Listed {} conversations for {}", listed.len(), me);
        Ok(listed)
    }

    /// Id of the conversation between `me` and `others`, creating it if none exists
    ///
    /// The scan and the create are separate store calls, so two concurrent callers can both
    /// miss and both create. The listing hides the duplicate.
    #[instrument(skip(self))]
    pub async fn create_or_get(&self, me: &str, others: &[String]) -> ChatResult<String> {
        let mut wanted: BTreeSet<String> = others
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        wanted.remove(me);
        if wanted.is_empty() {
            return Err(ChatError::Validation(
                "Pick at least one other person to message".to_string(),
            ));
        }
        wanted.insert(me.to_string());

        let ids: Vec<String> = self
            .store
            .memberships(me)
            .await?
            .into_iter()
            .map(|m| m.conversation_id)
            .collect();

        if !ids.is_empty() {
            let mut sets: HashMap<String, BTreeSet<String>> = HashMap::new();
            for participant in self.store.participants_in(&ids).await? {
                sets.entry(participant.conversation_id)
                    .or_default()
                    .insert(participant.user_id);
            }

            let matches: Vec<String> = sets
                .into_iter()
                .filter(|(_, set)| *set == wanted)
                .map(|(id, _)| id)
                .collect();

            if matches.len() > 1 {
                warn!(
                    "{} stored conversations share participants {:?}",
                    matches.len(),
                    wanted
                );
            }
            if let Some(existing) = self.most_recent(matches).await? {
                debug!("Reusing conversation {}", existing);
                return Ok(existing);
            }
        }

        let conversation = self.store.insert_conversation().await?;
        let members: Vec<String> = wanted.into_iter().collect();
        self.store
            .insert_participants(&conversation.id, &members)
            .await?;

        info!(
            "Created conversation {} for {}",
            conversation.id,
            canonical_key(members.iter().map(String::as_str))
        );
        Ok(conversation.id)
    }

    async fn most_recent(&self, ids: Vec<String>) -> ChatResult<Option<String>> {
        match ids.len() {
            0 => Ok(None),
            1 => Ok(ids.into_iter().next()),
            _ => Ok(self
                .store
                .conversations_by_ids(&ids)
                .await?
                .into_iter()
                .min_by(|a, b| {
                    precedence(
                        (a.last_activity_at(), a.id.as_str()),
                        (b.last_activity_at(), b.id.as_str()),
                    )
                })
                .map(|row| row.id)),
        }
    }
}

/// Order of two conversations by (activity, id): most recent first, then the smaller id
///
/// Both the listing and create-or-get pick the first row in this order, so they agree on
/// which of several duplicates survives.
fn precedence(a: (DateTime<Utc>, &str), b: (DateTime<Utc>, &str)) -> Ordering {
    b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

fn by_precedence(a: &Conversation, b: &Conversation) -> Ordering {
    precedence((a.last_activity_at(), a.id.as_str()), (b.last_activity_at(), b.id.as_str()))
}

/// Keep one conversation per canonical key (the first by precedence) and sort by activity
fn dedup_by_participants(conversations: Vec<Conversation>) -> Vec<Conversation> {
    let mut kept: HashMap<String, Conversation> = HashMap::new();
    for conversation in conversations {
        let key = conversation.canonical_key();
        match kept.get(&key) {
            Some(existing) if by_precedence(existing, &conversation) != Ordering::Greater => {
                debug!("Hiding duplicate conversation {}", conversation.id);
            }
            Some(existing) => {
                debug!("Hiding duplicate conversation {}", existing.id);
                kept.insert(key, conversation);
            }
            None => {
                kept.insert(key, conversation);
            }
        }
    }

    let mut listed: Vec<Conversation> = kept.into_values().collect();
    listed.sort_by(by_precedence);
    listed
}
