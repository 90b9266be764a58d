use super::{Completion, CompletionRequest, ProviderClient};
use crate::config::ProviderDescriptor;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thinkgate_core::{ProviderError, ProviderErrorKind, Role};
use tokio_util::sync::CancellationToken;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed with this text.
    Text(String),
    /// Fail with an error of this kind.
    Fail(ProviderErrorKind),
    /// Wait, then produce the inner reply. The wait honours cancellation.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    /// Shorthand for [`MockReply::Text`].
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Delays this reply by `delay`.
    pub fn after(self, delay: Duration) -> Self {
        Self::Delayed(delay, Box::new(self))
    }
}

type Responder = Arc<dyn Fn(&CompletionRequest, u32) -> MockReply + Send + Sync>;

/// In-process provider with scripted replies.
///
/// Queued replies are served first, in order; once the queue is empty the
/// responder (if any) decides. The responder sees the request and the
/// zero-based call number.
pub struct MockProvider {
    descriptor: ProviderDescriptor,
    queue: Mutex<VecDeque<MockReply>>,
    responder: Option<Responder>,
    calls: AtomicU32,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl MockProvider {
    /// A mock with no replies queued. Calls fail until some are added.
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self {
            descriptor,
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    /// Shorthand for a mock with the given id and priority.
    pub fn named(id: &str, priority: u32) -> Self {
        Self::new(ProviderDescriptor::mock(id, priority))
    }

    /// A mock that answers every request by echoing the last user message.
    pub fn echo(descriptor: ProviderDescriptor) -> Self {
        Self::new(descriptor).with_responder(|req, _| {
            let last = req
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            MockReply::text(format!("echo: {last}"))
        })
    }

    /// Queues replies to be served in order.
    pub fn with_replies(self, replies: impl IntoIterator<Item = MockReply>) -> Self {
        self.queue.lock().extend(replies);
        self
    }

    /// Sets the fallback used once the queue runs dry.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&CompletionRequest, u32) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Total calls received, including cancelled ones.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self, request: &CompletionRequest, call: u32) -> MockReply {
        if let Some(reply) = self.queue.lock().pop_front() {
            return reply;
        }
        match &self.responder {
            Some(responder) => responder(request, call),
            None => MockReply::Fail(ProviderErrorKind::ServerError),
        }
    }

    async fn play(&self, reply: MockReply, cancel: &CancellationToken) -> Result<Completion, ProviderError> {
        let mut reply = reply;
        loop {
            match reply {
                MockReply::Text(text) => {
                    return Ok(Completion {
                        text,
                        model: self.descriptor.model_id.clone(),
                        usage: None,
                    })
                }
                MockReply::Fail(kind) => {
                    return Err(ProviderError::new(
                        &self.descriptor.id,
                        kind,
                        format!("scripted {kind}"),
                    ))
                }
                MockReply::Delayed(delay, inner) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(ProviderError::cancelled(&self.descriptor.id));
                        }
                        _ = tokio::time::sleep(delay) => reply = *inner,
                    }
                }
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let reply = self.next_reply(request, call);
        self.play(reply, cancel).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use thinkgate_core::Message;

    fn req() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("ping")])
    }

    #[tokio::test]
    async fn queue_then_responder() {
        let mock = MockProvider::named("m", 0)
            .with_replies([MockReply::Fail(ProviderErrorKind::Timeout), MockReply::text("one")])
            .with_responder(|_, n| MockReply::text(format!("call {n}")));
        let cancel = CancellationToken::new();

        assert_eq!(
            mock.complete(&req(), &cancel).await.unwrap_err().kind,
            ProviderErrorKind::Timeout
        );
        assert_eq!(mock.complete(&req(), &cancel).await.unwrap().text, "one");
        assert_eq!(mock.complete(&req(), &cancel).await.unwrap().text, "call 2");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn echo_repeats_last_user_message() {
        let mock = MockProvider::echo(ProviderDescriptor::mock("echo", 0));
        let out = mock.complete(&req(), &CancellationToken::new()).await.unwrap();
        assert_eq!(out.text, "echo: ping");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_reply_is_cancellable() {
        let mock = Arc::new(
            MockProvider::named("slow", 0)
                .with_replies([MockReply::text("late").after(Duration::from_secs(10))]),
        );
        let cancel = CancellationToken::new();
        let task = {
            let mock = mock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { mock.complete(&req(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Cancelled);
        assert_eq!(mock.peak_concurrency(), 1);
    }
}
