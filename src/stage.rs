//! Forwarding pipeline stage.
//!
//! Announces every received file downstream under a fresh event id. Real
//! stages replace this with their file processing and publish the output
//! they produce.

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::bus::{EventService, Publisher, Result};

/// Republishes each received file on the publisher's routing key.
pub struct ForwardingStage {
    publisher: Publisher,
}

impl ForwardingStage {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl EventService for ForwardingStage {
    async fn handle(&self, event_id: &str, file_path: &str) -> Result<()> {
        let next_id = Uuid::new_v4().to_string();
        info!(
            event_id = %event_id,
            file_path = %file_path,
            next_event_id = %next_id,
            routing_key = %self.publisher.routing_key(),
            "Forwarding file"
        );
        self.publisher.file_created(&next_id, file_path).await
    }
}
