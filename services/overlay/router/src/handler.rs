//! Message handlers and their registry.

use crate::error::HandlerError;
use async_trait::async_trait;
use dashmap::DashMap;
use reload_wire::{Content, ContentType, Message};
use std::sync::{Arc, RwLock};

/// Handles requests of one content type addressed to this peer
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Produce the answer contents for `request`. An error is sent back as
    /// an error answer with the error's code.
    async fn handle(&self, request: &Message) -> Result<Content, HandlerError>;
}

/// Receives answers that match no pending request
#[async_trait]
pub trait AnswerHandler: Send + Sync {
    /// Consume an unmatched answer
    async fn handle_answer(&self, answer: Message);
}

/// Content type to handler map, filled explicitly at startup
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<ContentType, Arc<dyn MessageHandler>>,
    answers: RwLock<Option<Arc<dyn AnswerHandler>>>,
}

impl HandlerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle requests of `content_type` with `handler`, replacing any
    /// previous handler
    pub fn register(&self, content_type: ContentType, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(content_type, handler);
    }

    /// Remove the handler of `content_type`
    pub fn unregister(&self, content_type: ContentType) -> bool {
        self.handlers.remove(&content_type).is_some()
    }

    /// Handler of `content_type`
    pub fn get(&self, content_type: ContentType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&content_type).map(|h| h.value().clone())
    }

    /// Whether a handler is registered for `content_type`
    pub fn contains(&self, content_type: ContentType) -> bool {
        self.handlers.contains_key(&content_type)
    }

    /// Receive unmatched answers with `handler`
    pub fn set_answer_handler(&self, handler: Arc<dyn AnswerHandler>) {
        if let Ok(mut slot) = self.answers.write() {
            *slot = Some(handler);
        }
    }

    /// The unmatched-answer handler, if any
    pub fn answer_handler(&self) -> Option<Arc<dyn AnswerHandler>> {
        self.answers.read().ok().and_then(|slot| slot.clone())
    }

    /// Registered request types
    pub fn content_types(&self) -> Vec<ContentType> {
        let mut types: Vec<_> = self.handlers.iter().map(|e| *e.key()).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reload_wire::Header;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, request: &Message) -> Result<Content, HandlerError> {
            Ok(request.content.clone())
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(ContentType::PingRequest).is_none());

        registry.register(ContentType::PingRequest, Arc::new(Echo));
        registry.register(ContentType::Other(41), Arc::new(Echo));
        assert_eq!(
            registry.content_types(),
            vec![ContentType::PingRequest, ContentType::Other(41)]
        );

        let handler = registry.get(ContentType::PingRequest).unwrap();
        let request = Message::new(Header::builder(1).build(), Content::ping());
        assert_eq!(handler.handle(&request).await.unwrap(), Content::ping());

        assert!(registry.unregister(ContentType::PingRequest));
        assert!(!registry.contains(ContentType::PingRequest));
    }
}
