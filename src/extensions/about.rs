// ABOUTME: Bundled extension answering the /about command with bot identity info.
// ABOUTME: Demonstrates command registration plus an interaction listener.

use std::sync::Arc;

use async_trait::async_trait;

use crate::commands::{CommandDef, CommandScope};
use crate::events::{EventKind, GatewayEvent, LogEvent};
use crate::extension::{EventListener, Extension, ExtensionContext};
use crate::sink::SinkHandle;

pub struct About;

impl Extension for About {
    fn name(&self) -> &str {
        "about"
    }

    fn register(&self, ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        ctx.command(
            CommandDef::new(
                "about",
                "Show bot version and identity",
                CommandScope::Guild(ctx.guild_id()),
            )
            .localized_name("de", "über")
            .localized_description("de", "Version und Identität des Bots anzeigen"),
        );
        ctx.listen(
            EventKind::InteractionCreate,
            Arc::new(AboutListener {
                log: ctx.log().clone(),
            }),
        );
        Ok(())
    }
}

struct AboutListener {
    log: SinkHandle,
}

#[async_trait]
impl EventListener for AboutListener {
    async fn handle(&self, event: &GatewayEvent) -> anyhow::Result<()> {
        let command = event
            .payload
            .get("command")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        if command != "about" {
            return Ok(());
        }

        tracing::info!(event_id = %event.id, "Answering /about");
        self.log.enqueue(LogEvent::info(
            "extension:about",
            format!("chirp {} answering /about", env!("CARGO_PKG_VERSION")),
        ));
        Ok(())
    }
}
