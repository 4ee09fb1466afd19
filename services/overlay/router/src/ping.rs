//! Ping responder.

use crate::error::HandlerError;
use crate::handler::MessageHandler;
use async_trait::async_trait;
use reload_wire::{Content, Message};
use std::time::{SystemTime, UNIX_EPOCH};

/// Answers ping requests with a random response id and the local time
#[derive(Debug, Clone, Copy, Default)]
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, request: &Message) -> Result<Content, HandlerError> {
        if !matches!(request.content, Content::PingRequest { .. }) {
            return Err(HandlerError::Unsupported);
        }
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Content::PingAnswer {
            response_id: rand::random(),
            time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reload_wire::Header;

    #[tokio::test]
    async fn test_ping_answer() {
        let request = Message::new(Header::builder(1).build(), Content::ping());
        let answer = PingHandler.handle(&request).await.unwrap();
        let Content::PingAnswer { time, .. } = answer else {
            panic!("expected ping answer");
        };
        assert!(time > 1_600_000_000_000);
    }

    #[tokio::test]
    async fn test_rejects_other_requests() {
        let request = Message::new(Header::builder(1).build(), Content::LeaveAnswer);
        assert_eq!(
            PingHandler.handle(&request).await,
            Err(HandlerError::Unsupported)
        );
    }
}
