//! 内存存储
//!
//! 实现全部持久化端口，用于测试以及不连接 PostgreSQL 的本地运行。
//! 可以从 JSON 种子文件预置用户和会议。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use application::repository::{ChatMessageRepository, MeetingRepository, UserRepository};
use async_trait::async_trait;
use domain::{ChatIdentity, ChatMessage, Meeting, MeetingId, RepositoryError, UserId};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse seed file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 种子文件格式：`{"users": [ChatIdentity...], "meetings": [Meeting...]}`
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<ChatIdentity>,
    #[serde(default)]
    pub meetings: Vec<Meeting>,
}

#[derive(Default)]
struct State {
    users: HashMap<UserId, ChatIdentity>,
    meetings: HashMap<MeetingId, Meeting>,
    messages: HashMap<MeetingId, Vec<ChatMessage>>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::storage("in-memory store lock poisoned")
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: Seed) -> Self {
        let store = Self::new();
        for user in seed.users {
            store.insert_user(user);
        }
        for meeting in seed.meetings {
            store.insert_meeting(meeting);
        }
        store
    }

    pub fn load_seed_file(path: impl AsRef<Path>) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)?;
        let seed: Seed = serde_json::from_str(&raw)?;
        Ok(Self::from_seed(seed))
    }

    pub fn insert_user(&self, identity: ChatIdentity) {
        match self.state.write() {
            Ok(mut state) => {
                state.users.insert(identity.user_id, identity);
            }
            Err(_) => warn!(user_id = %identity.user_id, "in-memory store lock poisoned, user dropped"),
        }
    }

    pub fn insert_meeting(&self, meeting: Meeting) {
        match self.state.write() {
            Ok(mut state) => {
                state.meetings.insert(meeting.id, meeting);
            }
            Err(_) => warn!(meeting_id = %meeting.id, "in-memory store lock poisoned, meeting dropped"),
        }
    }

    pub fn message_count(&self, meeting_id: MeetingId) -> usize {
        self.state
            .read()
            .map(|state| state.messages.get(&meeting_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn find_identity(&self, id: UserId) -> Result<Option<ChatIdentity>, RepositoryError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.users.get(&id).cloned())
    }
}

#[async_trait]
impl MeetingRepository for InMemoryStore {
    async fn find_by_id(&self, id: MeetingId) -> Result<Option<Meeting>, RepositoryError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.meetings.get(&id).cloned())
    }

    async fn add_participant(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
        max_participants: u32,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let meeting = state
            .meetings
            .get_mut(&meeting_id)
            .ok_or(RepositoryError::NotFound)?;

        if meeting.is_participant(user_id)
            || meeting.participant_ids.len() >= max_participants as usize
        {
            return Ok(false);
        }
        meeting.participant_ids.push(user_id);
        Ok(true)
    }

    async fn remove_participant(
        &self,
        meeting_id: MeetingId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let Some(meeting) = state.meetings.get_mut(&meeting_id) else {
            return Ok(false);
        };

        let before = meeting.participant_ids.len();
        meeting.participant_ids.retain(|id| *id != user_id);
        Ok(meeting.participant_ids.len() < before)
    }
}

#[async_trait]
impl ChatMessageRepository for InMemoryStore {
    async fn save(&self, message: ChatMessage) -> Result<ChatMessage, RepositoryError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let history = state.messages.entry(message.meeting_id).or_default();
        if history.iter().any(|stored| stored.id == message.id) {
            return Err(RepositoryError::Conflict);
        }
        history.push(message.clone());
        Ok(message)
    }

    async fn recent(
        &self,
        meeting_id: MeetingId,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut messages = state.messages.get(&meeting_id).cloned().unwrap_or_default();
        // 稳定排序，同一时刻的消息保持插入顺序的逆序
        messages.reverse();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        messages.truncate(limit as usize);
        Ok(messages)
    }
}
