use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{
    FetchError, IdentityCache, IdentityObject, IdentityStoreClient, RecordType, SyncError,
};
use crate::session::SessionState;

/// Refreshes the identity cache for a session on demand.
pub struct IdentitySync {
    client: Arc<dyn IdentityStoreClient>,
    cache: Arc<IdentityCache>,
    fetch_timeout: Duration,
}

impl IdentitySync {
    pub fn new(
        client: Arc<dyn IdentityStoreClient>,
        cache: Arc<IdentityCache>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            fetch_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// Fetch the session record and its owning user, and store them in the cache.
    ///
    /// The session record is always fetched, even when cached, and failing to
    /// fetch or decode it is an error. A failed user lookup is only logged.
    /// Nothing is written for a fetch that fails, times out or is cancelled.
    #[tracing::instrument(
        name = "identity.force_sync",
        skip_all,
        fields(session_id = session.map(|s| s.id.as_str()).unwrap_or_default())
    )]
    pub async fn force_sync(
        &self,
        cancel: &CancellationToken,
        session: Option<&SessionState>,
    ) -> Result<(), SyncError> {
        let Some(session) = session else {
            return Ok(());
        };

        let object = self
            .fetch(cancel, RecordType::Session, &session.id)
            .await
            .map_err(|source| match source {
                FetchError::Cancelled => SyncError::Cancelled,
                FetchError::DeadlineExceeded => SyncError::DeadlineExceeded,
                source => SyncError::SessionNotFound {
                    id: session.id.clone(),
                    source,
                },
            })?;

        let user_id = match &object {
            IdentityObject::Session(identity) => identity.user_id.clone(),
            IdentityObject::User(_) => String::new(),
        };
        self.cache.insert(&session.id, object);

        if user_id.is_empty() {
            tracing::debug!("Session record has no owning user");
            return Ok(());
        }

        match self.fetch(cancel, RecordType::User, &user_id).await {
            Ok(user) => self.cache.insert(&user_id, user),
            Err(error) => tracing::warn!(
                user_id = %user_id,
                error = %error,
                "Failed to fetch user record, continuing without it"
            ),
        }

        Ok(())
    }

    async fn fetch(
        &self,
        cancel: &CancellationToken,
        record_type: RecordType,
        id: &str,
    ) -> Result<IdentityObject, FetchError> {
        let lookup = tokio::time::timeout(
            self.fetch_timeout,
            self.client.get(record_type.type_url(), id),
        );

        let record = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = lookup => result.map_err(|_| FetchError::DeadlineExceeded)??,
        };

        Ok(record.decode_as(record_type, id)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::identity::{
        IdentityError, IdentityRecord, IdentityStoreError, SESSION_TYPE_URL, USER_TYPE_URL,
    };

    type GetFn = dyn Fn(&str, &str) -> Result<IdentityRecord, IdentityStoreError> + Send + Sync;

    /// Identity store whose responses come from a closure.
    struct MockClient {
        get: Box<GetFn>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl MockClient {
        fn new(
            get: impl Fn(&str, &str) -> Result<IdentityRecord, IdentityStoreError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                get: Box::new(get),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl IdentityStoreClient for MockClient {
        async fn get(
            &self,
            type_url: &str,
            id: &str,
        ) -> Result<IdentityRecord, IdentityStoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.get)(type_url, id)
        }
    }

    fn not_found(type_url: &str, id: &str) -> IdentityStoreError {
        IdentityStoreError::NotFound {
            type_url: type_url.to_string(),
            id: id.to_string(),
        }
    }

    fn session_record(id: &str, user_id: &str) -> IdentityRecord {
        IdentityRecord {
            version: "1".to_string(),
            type_url: SESSION_TYPE_URL.to_string(),
            id: id.to_string(),
            data: json!({ "id": id, "user_id": user_id }),
        }
    }

    fn user_record(id: &str) -> IdentityRecord {
        IdentityRecord {
            version: "1".to_string(),
            type_url: USER_TYPE_URL.to_string(),
            id: id.to_string(),
            data: json!({ "id": id, "email": "foo@example.com" }),
        }
    }

    /// Store holding session S1 (owned by U1) and, optionally, user U1.
    fn store(with_user: bool) -> MockClient {
        MockClient::new(move |type_url, id| match (type_url, id) {
            (SESSION_TYPE_URL, "S1") => Ok(session_record("S1", "U1")),
            (USER_TYPE_URL, "U1") if with_user => Ok(user_record("U1")),
            _ => Err(not_found(type_url, id)),
        })
    }

    fn sync_with(client: MockClient) -> (IdentitySync, Arc<MockClient>) {
        let client = Arc::new(client);
        let sync = IdentitySync::new(
            Arc::clone(&client) as Arc<dyn IdentityStoreClient>,
            Arc::new(IdentityCache::new()),
            Duration::from_secs(5),
        );
        (sync, client)
    }

    fn session(id: &str) -> SessionState {
        SessionState {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_session_is_a_no_op() {
        let (sync, client) = sync_with(store(true));

        sync.force_sync(&CancellationToken::new(), None).await.unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn test_session_and_user_are_cached() {
        let (sync, client) = sync_with(store(true));

        sync.force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sync.cache().get_session("S1").unwrap().user_id, "U1");
        assert_eq!(
            sync.cache().get_user("U1").unwrap().email,
            "foo@example.com"
        );
    }

    #[tokio::test]
    async fn test_missing_session_is_fatal_and_writes_nothing() {
        let (sync, client) = sync_with(store(true));

        let err = sync
            .force_sync(&CancellationToken::new(), Some(&session("S2")))
            .await
            .unwrap_err();

        assert!(
            matches!(
                &err,
                SyncError::SessionNotFound {
                    id,
                    source: FetchError::Store(IdentityStoreError::NotFound { .. }),
                } if id == "S2"
            ),
            "{err}"
        );
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn test_missing_user_is_not_fatal() {
        let (sync, _) = sync_with(store(false));

        sync.force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap();

        assert!(sync.cache().get_session("S1").is_some());
        assert!(sync.cache().get_user("U1").is_none());
        assert_eq!(sync.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_session_is_fatal() {
        let (sync, _) = sync_with(MockClient::new(|_, id| {
            Ok(IdentityRecord {
                version: "1".to_string(),
                type_url: "type.googleapis.com/directory.Group".to_string(),
                id: id.to_string(),
                data: json!({}),
            })
        }));

        let err = sync
            .force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap_err();

        assert!(
            matches!(
                err,
                SyncError::SessionNotFound {
                    source: FetchError::Decode(IdentityError::Mismatch { .. }),
                    ..
                }
            ),
            "{err}"
        );
        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_user_is_not_fatal() {
        let (sync, _) = sync_with(MockClient::new(|type_url, id| match type_url {
            SESSION_TYPE_URL => Ok(session_record(id, "U1")),
            _ => Ok(IdentityRecord {
                data: json!("garbage"),
                ..user_record(id)
            }),
        }));

        sync.force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap();

        assert_eq!(sync.cache().len(), 1);
        assert!(sync.cache().get_user("U1").is_none());
    }

    #[tokio::test]
    async fn test_cached_session_is_not_trusted() {
        let (sync, _) = sync_with(store(true));
        sync.force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap();

        // The store forgets the session; the cached copy must not satisfy the sync.
        let forgetful = IdentitySync::new(
            Arc::new(MockClient::new(|type_url, id| Err(not_found(type_url, id)))),
            Arc::clone(sync.cache()),
            Duration::from_secs(5),
        );
        let err = forgetful
            .force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::SessionNotFound { .. }));
        // Existing entries are left untouched.
        assert!(forgetful.cache().get_session("S1").is_some());
        assert!(forgetful.cache().get_user("U1").is_some());
    }

    #[tokio::test]
    async fn test_session_without_user_skips_user_lookup() {
        let (sync, client) = sync_with(MockClient::new(|_, id| Ok(session_record(id, ""))));

        sync.force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sync.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let (sync, _) = sync_with(store(true));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = sync
            .force_sync(&cancel, Some(&session("S1")))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_during_fetch_returns_promptly() {
        let (sync, _) = sync_with(store(true).with_delay(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = sync
            .force_sync(&cancel, Some(&session("S1")))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn test_session_fetch_deadline() {
        let client = Arc::new(store(true).with_delay(Duration::from_secs(30)));
        let sync = IdentitySync::new(
            client,
            Arc::new(IdentityCache::new()),
            Duration::from_millis(20),
        );

        let err = sync
            .force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::DeadlineExceeded));
        assert!(sync.cache().is_empty());
    }

    #[tokio::test]
    async fn test_user_fetch_deadline_is_not_fatal() {
        /// Answers session lookups immediately and hangs on user lookups.
        struct SlowUsers;

        #[async_trait]
        impl IdentityStoreClient for SlowUsers {
            async fn get(
                &self,
                type_url: &str,
                id: &str,
            ) -> Result<IdentityRecord, IdentityStoreError> {
                if type_url == USER_TYPE_URL {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(session_record(id, "U1"))
            }
        }

        let sync = IdentitySync::new(
            Arc::new(SlowUsers),
            Arc::new(IdentityCache::new()),
            Duration::from_millis(20),
        );

        sync.force_sync(&CancellationToken::new(), Some(&session("S1")))
            .await
            .unwrap();

        assert_eq!(sync.cache().len(), 1);
        assert!(sync.cache().get_session("S1").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_syncs_share_the_cache() {
        let (sync, _) = sync_with(MockClient::new(|type_url, id| match type_url {
            SESSION_TYPE_URL => Ok(session_record(id, "U1")),
            _ => Ok(user_record(id)),
        }));
        let sync = Arc::new(sync);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let sync = Arc::clone(&sync);
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    let session = session(&format!("S{i}"));
                    sync.force_sync(&cancel, Some(&session)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // 16 sessions, all owned by the same user
        assert_eq!(sync.cache().len(), 17);
    }
}
