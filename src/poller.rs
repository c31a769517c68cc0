//! Claim poller - cursor bookkeeping over the claim transport

use crate::classifier::{classify, ClaimEvent, ClassifyContext};
use crate::transport::{ClaimTransport, MessageCursor};
use tracing::{debug, info, warn};

/// Pulls unseen messages and classifies them for the current phase
#[derive(Debug)]
pub struct ClaimPoller {
    cursor: MessageCursor,
    batch_limit: usize,
    transport_failures: u32,
}

impl ClaimPoller {
    pub fn new(batch_limit: usize) -> Self {
        Self {
            cursor: MessageCursor::default(),
            batch_limit: batch_limit.max(1),
            transport_failures: 0,
        }
    }

    pub fn cursor(&self) -> MessageCursor {
        self.cursor
    }

    pub fn transport_failures(&self) -> u32 {
        self.transport_failures
    }

    /// Start over for a brand-new pairing session
    pub fn reset(&mut self) {
        self.cursor = MessageCursor::default();
        self.transport_failures = 0;
    }

    /// One poll tick.
    ///
    /// The cursor moves past the whole batch whether or not anything
    /// matched; messages after the first match are consumed unprocessed.
    pub async fn poll<T: ClaimTransport>(
        &mut self,
        transport: &mut T,
        ctx: &ClassifyContext<'_>,
    ) -> Option<ClaimEvent> {
        let batch = match transport.fetch(self.cursor, self.batch_limit).await {
            Ok(batch) => batch,
            Err(e) => {
                self.transport_failures += 1;
                warn!(
                    failures = self.transport_failures,
                    cursor = self.cursor.position(),
                    "Claim poll failed: {}",
                    e
                );
                return None;
            }
        };

        if let Some(high_water) = batch.high_water {
            self.cursor.advance(high_water);
        }

        let mut event = None;
        for msg in &batch.messages {
            if event.is_some() {
                debug!(seq = msg.seq, "Consumed after match");
                continue;
            }
            event = classify(ctx, msg);
            match &event {
                Some(found) => info!(seq = msg.seq, chat_id = %msg.chat_id, ?found, "Claim event"),
                None => debug!(seq = msg.seq, chat_id = %msg.chat_id, "Message ignored"),
            }
        }

        event
    }
}
