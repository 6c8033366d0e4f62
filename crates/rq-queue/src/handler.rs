use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rq_common::Message;

/// Predicate + action pair owned by a queue.
///
/// A queue runs the first handler whose `can_handle` accepts the message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn can_handle(&self, message: &Message) -> bool;

    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Handler built from a predicate closure and an async action closure.
pub struct FnHandler<P, F> {
    can_handle: P,
    action: F,
}

impl<P, F, Fut> FnHandler<P, F>
where
    P: Fn(&Message) -> bool + Send + Sync + 'static,
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(can_handle: P, action: F) -> Self {
        Self { can_handle, action }
    }
}

#[async_trait]
impl<P, F, Fut> MessageHandler for FnHandler<P, F>
where
    P: Fn(&Message) -> bool + Send + Sync + 'static,
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn can_handle(&self, message: &Message) -> bool {
        (self.can_handle)(message)
    }

    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.action)(message.clone()).await
    }
}

/// Handler matching on the message name.
pub struct NamedHandler<F> {
    name: String,
    action: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for NamedHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn can_handle(&self, message: &Message) -> bool {
        message.name == self.name
    }

    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.action)(message.clone()).await
    }
}

/// Handler for every message named `name`.
pub fn handler_for<F, Fut>(name: impl Into<String>, action: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(NamedHandler {
        name: name.into(),
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_named_handler_matches_on_name() {
        let handler = handler_for("created", |_msg| async { Ok(()) });
        let created = Message::from_bytes("created", Vec::new());
        let deleted = Message::from_bytes("deleted", Vec::new());

        assert!(handler.can_handle(&created));
        assert!(!handler.can_handle(&deleted));
        assert!(handler.handle(&created).await.is_ok());
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new(
            |msg: &Message| msg.retry_count == 0,
            |msg: Message| async move { Err(anyhow::anyhow!("cannot handle {}", msg.name)) },
        );
        let msg = Message::from_bytes("created", Vec::new());

        assert!(handler.can_handle(&msg));
        assert!(!handler.can_handle(&msg.clone().with_retry_count(1)));
        let err = handler.handle(&msg).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot handle created");
    }
}
