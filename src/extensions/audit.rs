// ABOUTME: Bundled extension that reports session and membership events to the webhook sink.
// ABOUTME: Listens for Ready and MemberJoin; registers no commands.

use std::sync::Arc;

use async_trait::async_trait;

use crate::events::{EventKind, GatewayEvent, LogEvent};
use crate::extension::{EventListener, Extension, ExtensionContext};
use crate::sink::SinkHandle;

pub struct Audit;

impl Extension for Audit {
    fn name(&self) -> &str {
        "audit"
    }

    fn register(&self, ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        let listener = Arc::new(AuditListener {
            log: ctx.log().clone(),
        });
        ctx.listen(EventKind::Ready, listener.clone());
        ctx.listen(EventKind::MemberJoin, listener);
        Ok(())
    }
}

struct AuditListener {
    log: SinkHandle,
}

#[async_trait]
impl EventListener for AuditListener {
    async fn handle(&self, event: &GatewayEvent) -> anyhow::Result<()> {
        match event.kind {
            EventKind::Ready => {
                self.log
                    .enqueue(LogEvent::info("extension:audit", "session ready"));
            }
            EventKind::MemberJoin => {
                let member = event
                    .payload
                    .get("user")
                    .and_then(|u| u.as_str())
                    .unwrap_or("unknown");
                self.log.enqueue(
                    LogEvent::info("extension:audit", format!("member joined: {}", member))
                        .with_context(event.payload.clone()),
                );
            }
            _ => {}
        }
        Ok(())
    }
}
