//! The relay loop: poll updates, react to `/start`, forward text to the AI
//! backend, send the first candidate back.
//!
//! Delivery is at-least-once within a process lifetime: the cursor only moves
//! past an update once its processing finished, whether that processing
//! succeeded or not.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    command::{parse_command, Command, GREETING},
    config::POLL_INTERVAL,
    domain::{ChatId, Update, UpdateId},
    errors::Error,
    ports::{CompletionBackend, ReplySink, UpdateSource},
    session::{ChatSessions, SessionScope},
    Result,
};

/// What happened to a single update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// `/start` seen, greeting sent.
    Greeted,
    /// AI reply sent back to the chat.
    Replied,
    /// Backend answered with zero candidates; nothing sent.
    NoCandidates,
    /// Not a command and the chat is not started, or no text at all.
    Ignored,
    /// Backend call failed; nothing sent.
    BackendFailed,
    /// Outbound send failed (greeting or reply).
    SendFailed,
}

/// Result of one poll + batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Offset the fetch was issued with.
    pub offset: i64,
    pub outcomes: Vec<(UpdateId, Outcome)>,
}

pub struct RelayLoop {
    source: Arc<dyn UpdateSource>,
    sink: Arc<dyn ReplySink>,
    backend: Arc<dyn CompletionBackend>,
    sessions: ChatSessions,
    cursor: UpdateId,
    poll_interval: Duration,
}

impl RelayLoop {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        sink: Arc<dyn ReplySink>,
        backend: Arc<dyn CompletionBackend>,
        scope: SessionScope,
    ) -> Self {
        Self {
            source,
            sink,
            backend,
            sessions: ChatSessions::new(scope),
            cursor: UpdateId::default(),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Highest update id processed so far.
    pub fn cursor(&self) -> UpdateId {
        self.cursor
    }

    /// Offset the next fetch will request.
    pub fn next_offset(&self) -> i64 {
        self.cursor.next()
    }

    pub fn sessions(&self) -> &ChatSessions {
        &self.sessions
    }

    /// Poll until `cancel` fires.
    ///
    /// Fetch failures are logged and retried after the poll interval.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            backend = self.backend.name(),
            scope = ?self.sessions.scope(),
            interval_secs = self.poll_interval.as_secs(),
            "relay loop started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.tick(&cancel).await {
                Ok(report) => {
                    if !report.outcomes.is_empty() {
                        debug!(
                            offset = report.offset,
                            processed = report.outcomes.len(),
                            cursor = self.cursor.0,
                            "batch processed"
                        );
                    }
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    warn!(offset = self.next_offset(), error = %e, "failed to get updates");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.poll_interval) => {}
            }
        }

        info!(cursor = self.cursor.0, "relay loop stopped");
        Ok(())
    }

    /// One iteration: fetch from the cursor, process the batch in order.
    ///
    /// Returns `Err` only when the fetch failed (cursor untouched) or
    /// `cancel` fired. Updates finished before a cancellation keep their
    /// cursor advance.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<TickReport> {
        let offset = self.next_offset();
        let updates = guarded(cancel, self.source.fetch_updates(offset)).await?;

        let mut report = TickReport {
            offset,
            outcomes: Vec::with_capacity(updates.len()),
        };

        for update in updates {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let outcome = self.process(&update, cancel).await?;
            self.advance(update.update_id);
            report.outcomes.push((update.update_id, outcome));
        }

        Ok(report)
    }

    fn advance(&mut self, update_id: UpdateId) {
        if update_id > self.cursor {
            self.cursor = update_id;
        }
    }

    async fn process(&mut self, update: &Update, cancel: &CancellationToken) -> Result<Outcome> {
        let (Some(chat_id), Some(text)) = (update.chat_id(), update.text_ref()) else {
            debug!(update_id = update.update_id.0, "skipping update without text");
            return Ok(Outcome::Ignored);
        };

        info!(update_id = update.update_id.0, chat_id = chat_id.0, "received message");
        debug!(text, "message text");

        if parse_command(text) == Some(Command::Start) {
            self.sessions.activate(chat_id);
            return self.send(chat_id, GREETING, Outcome::Greeted, cancel).await;
        }

        if !self.sessions.is_active(chat_id) {
            debug!(chat_id = chat_id.0, "chat not started, ignoring");
            return Ok(Outcome::Ignored);
        }

        let candidates = match guarded(cancel, self.backend.complete(text)).await {
            Ok(c) => c,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(
                    update_id = update.update_id.0,
                    backend = self.backend.name(),
                    error = %e,
                    "completion failed"
                );
                return Ok(Outcome::BackendFailed);
            }
        };

        if candidates.len() > 1 {
            debug!(extra = candidates.len() - 1, "discarding extra candidates");
        }
        let Some(reply) = candidates.into_iter().next() else {
            info!(update_id = update.update_id.0, "backend returned no candidates");
            return Ok(Outcome::NoCandidates);
        };

        self.send(chat_id, &reply, Outcome::Replied, cancel).await
    }

    async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
        on_success: Outcome,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        match guarded(cancel, self.sink.send_text(chat_id, text)).await {
            Ok(body) => {
                debug!(chat_id = chat_id.0, response = %body, "reply sent");
                Ok(on_success)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warn!(chat_id = chat_id.0, error = %e, "failed to send reply");
                Ok(Outcome::SendFailed)
            }
        }
    }
}

/// Race `fut` against cancellation.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeSource {
        batches: Mutex<VecDeque<Result<Vec<Update>>>>,
        offsets: Mutex<Vec<i64>>,
        /// Cancelled once every queued batch has been handed out.
        cancel_when_drained: Option<CancellationToken>,
    }

    impl FakeSource {
        fn new(batches: Vec<Result<Vec<Update>>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
                ..Default::default()
            }
        }

        fn offsets(&self) -> Vec<i64> {
            self.offsets.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpdateSource for FakeSource {
        async fn fetch_updates(&self, offset: i64) -> Result<Vec<Update>> {
            self.offsets.lock().unwrap().push(offset);
            let next = self.batches.lock().unwrap().pop_front();
            match next {
                Some(batch) => batch,
                None => {
                    if let Some(token) = &self.cancel_when_drained {
                        token.cancel();
                    }
                    Ok(Vec::new())
                }
            }
        }
    }

    #[derive(Default)]
    struct FakeSink {
        sends: Mutex<Vec<(ChatId, String)>>,
        fail: bool,
    }

    impl FakeSink {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn sends(&self) -> Vec<(ChatId, String)> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplySink for FakeSink {
        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<String> {
            self.sends.lock().unwrap().push((chat_id, text.to_string()));
            if self.fail {
                return Err(Error::api(400, "Bad Request: chat not found"));
            }
            Ok(r#"{"ok":true}"#.to_string())
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        replies: Mutex<VecDeque<Result<Vec<String>>>>,
        prompts: Mutex<Vec<String>>,
        hang: bool,
    }

    impl FakeBackend {
        fn new(replies: Vec<Result<Vec<String>>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(&self, prompt: &str) -> Result<Vec<String>> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.hang {
                std::future::pending::<()>().await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn candidates(items: &[&str]) -> Result<Vec<String>> {
        Ok(items.iter().map(|s| s.to_string()).collect())
    }

    fn relay(
        source: &Arc<FakeSource>,
        sink: &Arc<FakeSink>,
        backend: &Arc<FakeBackend>,
        scope: SessionScope,
    ) -> RelayLoop {
        RelayLoop::new(source.clone(), sink.clone(), backend.clone(), scope)
    }

    #[tokio::test]
    async fn start_command_greets_and_advances_cursor() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![Update::text(1, 10, "/start")])]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::default());
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);
        let cancel = CancellationToken::new();

        let report = relay.tick(&cancel).await.unwrap();

        assert_eq!(report.offset, 1);
        assert_eq!(report.outcomes, vec![(UpdateId(1), Outcome::Greeted)]);
        assert_eq!(sink.sends(), vec![(ChatId(10), GREETING.to_string())]);
        assert_eq!(relay.cursor(), UpdateId(1));
        assert!(relay.sessions().is_active(ChatId(10)));
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn active_chat_gets_first_candidate() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![Update::text(1, 10, "/start")]),
            Ok(vec![Update::text(2, 10, "hello")]),
        ]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::new(vec![candidates(&["hi there", "hey"])]));
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);
        let cancel = CancellationToken::new();

        relay.tick(&cancel).await.unwrap();
        let report = relay.tick(&cancel).await.unwrap();

        assert_eq!(report.outcomes, vec![(UpdateId(2), Outcome::Replied)]);
        assert_eq!(backend.prompts(), vec!["hello".to_string()]);
        assert_eq!(
            sink.sends(),
            vec![
                (ChatId(10), GREETING.to_string()),
                (ChatId(10), "hi there".to_string()),
            ]
        );
        assert_eq!(relay.cursor(), UpdateId(2));
        assert_eq!(source.offsets(), vec![1, 2]);
    }

    #[tokio::test]
    async fn text_before_start_makes_no_calls() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![
            Update::text(1, 10, "hello"),
            Update::text(2, 10, "/starting"),
        ])]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::new(vec![candidates(&["never"])]));
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let report = relay.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            report.outcomes,
            vec![
                (UpdateId(1), Outcome::Ignored),
                (UpdateId(2), Outcome::Ignored),
            ]
        );
        assert!(backend.prompts().is_empty());
        assert!(sink.sends().is_empty());
        assert_eq!(relay.cursor(), UpdateId(2));
    }

    #[tokio::test]
    async fn repeated_start_greets_each_time() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![
            Update::text(1, 10, "/start"),
            Update::text(2, 10, "/start@mybot hello"),
        ])]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::default());
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let report = relay.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            report.outcomes,
            vec![
                (UpdateId(1), Outcome::Greeted),
                (UpdateId(2), Outcome::Greeted),
            ]
        );
        assert_eq!(sink.sends().len(), 2);
        assert!(relay.sessions().is_active(ChatId(10)));
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn zero_candidates_sends_nothing() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![
            Update::text(1, 10, "/start"),
            Update::text(2, 10, "hello"),
        ])]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::new(vec![candidates(&[])]));
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let report = relay.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcomes[1], (UpdateId(2), Outcome::NoCandidates));
        assert_eq!(sink.sends(), vec![(ChatId(10), GREETING.to_string())]);
        assert_eq!(relay.cursor(), UpdateId(2));
    }

    #[tokio::test]
    async fn backend_failure_still_advances_cursor() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![
            Update::text(1, 10, "/start"),
            Update::text(2, 10, "first"),
            Update::text(3, 10, "second"),
        ])]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::new(vec![
            Err(Error::api(500, "upstream down")),
            candidates(&["ok"]),
        ]));
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let report = relay.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            report.outcomes,
            vec![
                (UpdateId(1), Outcome::Greeted),
                (UpdateId(2), Outcome::BackendFailed),
                (UpdateId(3), Outcome::Replied),
            ]
        );
        assert_eq!(sink.sends().last().unwrap().1, "ok");
        assert_eq!(relay.cursor(), UpdateId(3));
    }

    #[tokio::test]
    async fn send_failure_is_logged_not_escalated() {
        let source = Arc::new(FakeSource::new(vec![Ok(vec![
            Update::text(1, 10, "/start"),
            Update::text(2, 10, "hello"),
        ])]));
        let sink = Arc::new(FakeSink::failing());
        let backend = Arc::new(FakeBackend::new(vec![candidates(&["hi"])]));
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let report = relay.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            report.outcomes,
            vec![
                (UpdateId(1), Outcome::SendFailed),
                (UpdateId(2), Outcome::SendFailed),
            ]
        );
        // Activation does not depend on the greeting being delivered.
        assert!(relay.sessions().is_active(ChatId(10)));
        assert_eq!(relay.cursor(), UpdateId(2));
    }

    #[tokio::test]
    async fn fetch_error_leaves_cursor_untouched() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![Update::text(4, 10, "/start")]),
            Err(Error::External("connection refused".into())),
            Ok(vec![]),
        ]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::default());
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);
        let cancel = CancellationToken::new();

        relay.tick(&cancel).await.unwrap();
        let err = relay.tick(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::External(_)));
        assert_eq!(relay.cursor(), UpdateId(4));
        assert_eq!(sink.sends().len(), 1);

        relay.tick(&cancel).await.unwrap();
        assert_eq!(source.offsets(), vec![1, 5, 5]);
    }

    #[tokio::test]
    async fn next_offset_follows_max_seen_id() {
        let source = Arc::new(FakeSource::new(vec![
            Ok(vec![
                Update::text(5, 10, "a"),
                Update::text(9, 10, "b"),
                Update {
                    update_id: UpdateId(12),
                    message: None,
                },
            ]),
            Ok(vec![]),
        ]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::default());
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);
        let cancel = CancellationToken::new();

        relay.tick(&cancel).await.unwrap();
        relay.tick(&cancel).await.unwrap();

        assert_eq!(source.offsets(), vec![1, 13]);
        assert_eq!(relay.next_offset(), 13);
    }

    #[tokio::test]
    async fn activation_is_scoped_per_chat() {
        let batch = || {
            Ok(vec![
                Update::text(1, 10, "/start"),
                Update::text(2, 20, "hello from another chat"),
            ])
        };

        let source = Arc::new(FakeSource::new(vec![batch()]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::new(vec![candidates(&["reply"])]));
        let mut per_chat = relay(&source, &sink, &backend, SessionScope::PerChat);
        let report = per_chat.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes[1], (UpdateId(2), Outcome::Ignored));
        assert!(backend.prompts().is_empty());

        let source = Arc::new(FakeSource::new(vec![batch()]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::new(vec![candidates(&["reply"])]));
        let mut global = relay(&source, &sink, &backend, SessionScope::Global);
        let report = global.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes[1], (UpdateId(2), Outcome::Replied));
        assert_eq!(sink.sends()[1], (ChatId(20), "reply".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_after_fetch_error() {
        let cancel = CancellationToken::new();
        let source = Arc::new(FakeSource {
            cancel_when_drained: Some(cancel.clone()),
            ..FakeSource::new(vec![
                Err(Error::External("timeout".into())),
                Ok(vec![Update::text(1, 10, "/start")]),
            ])
        });
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::default());
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let started = tokio::time::Instant::now();
        relay.run(cancel).await.unwrap();

        assert_eq!(source.offsets(), vec![1, 1, 2]);
        assert_eq!(sink.sends(), vec![(ChatId(10), GREETING.to_string())]);
        assert_eq!(relay.cursor(), UpdateId(1));
        let elapsed = started.elapsed();
        assert!(elapsed >= POLL_INTERVAL * 2 && elapsed < POLL_INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_blocking_call() {
        let cancel = CancellationToken::new();
        let source = Arc::new(FakeSource::new(vec![Ok(vec![
            Update::text(1, 10, "/start"),
            Update::text(2, 10, "this never finishes"),
        ])]));
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend {
            hang: true,
            ..Default::default()
        });
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let stopper = cancel.clone();
        let (res, ()) = tokio::join!(relay.run(cancel), async move {
            sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });

        res.unwrap();
        assert_eq!(backend.prompts(), vec!["this never finishes".to_string()]);
        assert_eq!(sink.sends().len(), 1);
        assert_eq!(relay.cursor(), UpdateId(1));
    }

    #[tokio::test]
    async fn run_returns_immediately_when_already_cancelled() {
        let source = Arc::new(FakeSource::default());
        let sink = Arc::new(FakeSink::default());
        let backend = Arc::new(FakeBackend::default());
        let mut relay = relay(&source, &sink, &backend, SessionScope::PerChat);

        let cancel = CancellationToken::new();
        cancel.cancel();
        relay.run(cancel).await.unwrap();

        assert!(source.offsets().is_empty());
    }
}
