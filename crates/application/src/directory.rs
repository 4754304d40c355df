//! 会话目录：私信会话的幂等获取/创建、房间创建、成员校验

use std::sync::Arc;

use domain::{
    Conversation, ConversationId, ConversationRepository, DisplayProfile, ParticipantPair,
    RepositoryError, UserId,
};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ApplicationError, ApplicationResult};
use crate::identity::{resolve_profile, ProfileDirectory};

/// 唯一约束冲突后的最大尝试次数。冲突说明另一个请求刚刚建好，下一轮查找必然命中。
const MAX_CREATE_ATTEMPTS: usize = 3;

/// 带双方展示资料的会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation: Conversation,
    pub participant_a: DisplayProfile,
    pub participant_b: DisplayProfile,
}

impl ConversationView {
    /// 从 `viewer` 角度看的对方资料
    pub fn peer_of(&self, viewer: UserId) -> &DisplayProfile {
        if self.participant_a.user_id == viewer {
            &self.participant_b
        } else {
            &self.participant_a
        }
    }

    pub fn profile_of(&self, user_id: UserId) -> Option<&DisplayProfile> {
        [&self.participant_a, &self.participant_b]
            .into_iter()
            .find(|profile| profile.user_id == user_id)
    }
}

pub struct ConversationDirectory {
    conversations: Arc<dyn ConversationRepository>,
    profiles: Arc<dyn ProfileDirectory>,
    clock: Arc<dyn Clock>,
}

impl ConversationDirectory {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        profiles: Arc<dyn ProfileDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conversations,
            profiles,
            clock,
        }
    }

    /// 获取两人之间唯一的私信会话，不存在时创建。参数顺序不影响结果。
    ///
    /// 已存在的会话不会被 `title`/`description` 覆盖。
    pub async fn get_or_create_direct(
        &self,
        initiator: UserId,
        peer: UserId,
        title: Option<String>,
        description: Option<String>,
    ) -> ApplicationResult<ConversationView> {
        let pair = ParticipantPair::new(initiator, peer)?;

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            if let Some(existing) = self.conversations.find_direct(pair).await? {
                return Ok(self.hydrate(existing).await);
            }

            let candidate = Conversation::new_direct(
                ConversationId::from(Uuid::new_v4()),
                initiator,
                peer,
                title.clone(),
                description.clone(),
                self.clock.now(),
            )?;

            match self.conversations.insert(candidate).await {
                Ok(created) => {
                    tracing::info!(
                        conversation_id = %created.id,
                        initiator = %initiator,
                        peer = %peer,
                        "direct conversation created"
                    );
                    return Ok(self.hydrate(created).await);
                }
                Err(RepositoryError::Conflict) => {
                    tracing::debug!(
                        initiator = %initiator,
                        peer = %peer,
                        attempt,
                        "direct conversation created concurrently, retrying lookup"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        tracing::error!(
            initiator = %initiator,
            peer = %peer,
            "direct conversation still conflicting after retries"
        );
        Err(ApplicationError::unavailable(
            "could not resolve direct conversation",
        ))
    }

    /// 创建带标题的房间，同一对用户可以有多个
    pub async fn open_room(
        &self,
        creator: UserId,
        peer: UserId,
        title: String,
        description: Option<String>,
    ) -> ApplicationResult<ConversationView> {
        let room = Conversation::new_room(
            ConversationId::from(Uuid::new_v4()),
            creator,
            peer,
            title,
            description,
            self.clock.now(),
        )?;
        let created = self.conversations.insert(room).await?;
        tracing::info!(conversation_id = %created.id, creator = %creator, "room opened");
        Ok(self.hydrate(created).await)
    }

    pub async fn get(&self, conversation_id: ConversationId) -> ApplicationResult<Conversation> {
        self.conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| ApplicationError::not_found(format!("conversation {conversation_id}")))
    }

    /// 校验 `user_id` 是会话参与者，通过时返回会话
    pub async fn membership_check(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ApplicationResult<Conversation> {
        let conversation = self.get(conversation_id).await?;
        if !conversation.has_participant(user_id) {
            return Err(ApplicationError::forbidden(
                "you are not a participant of this conversation",
            ));
        }
        Ok(conversation)
    }

    /// 用户参与的会话，最近活跃的在前
    pub async fn list_for_user(&self, user_id: UserId) -> ApplicationResult<Vec<Conversation>> {
        Ok(self.conversations.list_for_user(user_id).await?)
    }

    pub async fn hydrate(&self, conversation: Conversation) -> ConversationView {
        let (participant_a, participant_b) = tokio::join!(
            resolve_profile(self.profiles.as_ref(), conversation.participant_a_id),
            resolve_profile(self.profiles.as_ref(), conversation.participant_b_id),
        );
        ConversationView {
            conversation,
            participant_a,
            participant_b,
        }
    }
}

#[cfg(test)]
mod tests {
    use domain::MockConversationRepository;
    use futures::future::join_all;

    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::{InMemoryProfileDirectory, InMemoryStore};

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn directory(store: Arc<InMemoryStore>) -> ConversationDirectory {
        ConversationDirectory::new(
            store,
            Arc::new(InMemoryProfileDirectory::default()),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_get_or_create_yields_one_conversation() {
        let store = Arc::new(InMemoryStore::default());
        let directory = Arc::new(directory(Arc::clone(&store)));
        let (a, b) = (user(), user());

        let calls = (0..16).map(|i| {
            let directory = Arc::clone(&directory);
            tokio::spawn(async move {
                let (x, y) = if i % 2 == 0 { (a, b) } else { (b, a) };
                directory.get_or_create_direct(x, y, None, None).await
            })
        });
        let ids: Vec<_> = join_all(calls)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().conversation.id)
            .collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(store.list_for_user(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected() {
        let directory = directory(Arc::new(InMemoryStore::default()));
        let a = user();
        let err = directory
            .get_or_create_direct(a, a, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn conflict_is_resolved_by_retrying_lookup() {
        let (a, b) = (user(), user());
        let winner =
            Conversation::new_direct(ConversationId::from(Uuid::new_v4()), b, a, None, None, chrono::Utc::now())
                .unwrap();
        let expected = winner.id;

        let mut repo = MockConversationRepository::new();
        let mut lookups = 0;
        repo.expect_find_direct().times(2).returning(move |_| {
            lookups += 1;
            let found = (lookups > 1).then(|| winner.clone());
            Box::pin(async move { Ok(found) })
        });
        repo.expect_insert()
            .times(1)
            .returning(|_| Box::pin(async { Err(RepositoryError::Conflict) }));

        let directory = ConversationDirectory::new(
            Arc::new(repo),
            Arc::new(InMemoryProfileDirectory::default()),
            Arc::new(SystemClock),
        );
        let view = directory.get_or_create_direct(a, b, None, None).await.unwrap();
        assert_eq!(view.conversation.id, expected);
    }

    #[tokio::test]
    async fn persistent_conflict_surfaces_as_unavailable() {
        let mut repo = MockConversationRepository::new();
        repo.expect_find_direct()
            .returning(|_| Box::pin(async { Ok(None) }));
        repo.expect_insert()
            .times(MAX_CREATE_ATTEMPTS)
            .returning(|_| Box::pin(async { Err(RepositoryError::Conflict) }));

        let directory = ConversationDirectory::new(
            Arc::new(repo),
            Arc::new(InMemoryProfileDirectory::default()),
            Arc::new(SystemClock),
        );
        let err = directory
            .get_or_create_direct(user(), user(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
    }

    #[tokio::test]
    async fn membership_check_distinguishes_missing_and_forbidden() {
        let directory = directory(Arc::new(InMemoryStore::default()));
        let (a, b) = (user(), user());
        let view = directory.get_or_create_direct(a, b, None, None).await.unwrap();

        let missing = directory
            .membership_check(ConversationId::from(Uuid::new_v4()), a)
            .await
            .unwrap_err();
        assert_eq!(missing.code(), "NOT_FOUND");

        let outsider = directory
            .membership_check(view.conversation.id, user())
            .await
            .unwrap_err();
        assert_eq!(outsider.code(), "FORBIDDEN");

        assert!(directory.membership_check(view.conversation.id, b).await.is_ok());
    }

    #[tokio::test]
    async fn rooms_are_not_deduplicated() {
        let directory = directory(Arc::new(InMemoryStore::default()));
        let (a, b) = (user(), user());
        let first = directory
            .open_room(a, b, "Backend engineer".to_string(), None)
            .await
            .unwrap();
        let second = directory
            .open_room(a, b, "Data engineer".to_string(), None)
            .await
            .unwrap();
        let direct = directory.get_or_create_direct(a, b, None, None).await.unwrap();

        assert_ne!(first.conversation.id, second.conversation.id);
        assert!(!first.conversation.is_direct_message);
        assert_ne!(direct.conversation.id, first.conversation.id);
        assert_eq!(directory.list_for_user(b).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn hydrate_uses_known_profiles() {
        let store = Arc::new(InMemoryStore::default());
        let profiles = Arc::new(InMemoryProfileDirectory::default());
        let (a, b) = (user(), user());
        profiles
            .insert(DisplayProfile {
                user_id: a,
                username: "acme-hr".to_string(),
                name: Some("Acme HR".to_string()),
                role: Some("employer".to_string()),
            })
            .await;
        let directory = ConversationDirectory::new(store, profiles, Arc::new(SystemClock));

        let view = directory.get_or_create_direct(b, a, None, None).await.unwrap();
        assert_eq!(view.peer_of(b).display_name(), "Acme HR");
        assert_eq!(view.peer_of(a), &DisplayProfile::unknown(b));
    }
}
