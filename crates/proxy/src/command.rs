//! Command & permission layer.
//!
//! A chat line beginning with the configured prefix is tokenized into
//! `command ...args`. Commands are registered in an ordered map (last
//! registration wins, so plugins can override built-ins), each with an
//! optional usage/description and a permission predicate. Unknown commands
//! are not consumed: the dispatcher reports "not handled" and the raw chat
//! falls through to the backend server, which may know the command.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ghostlink_core::link::LinkState;
use indexmap::IndexMap;

use crate::net::session::Session;
use crate::splice::SpliceCore;

/// Pause between `|`-chained commands so a burst of them does not overwhelm
/// the transport.
pub const COMMAND_CHAIN_DELAY: Duration = Duration::from_millis(300);

/// Everything a handler gets to work with.
pub struct CommandCtx {
    pub splice: Arc<SpliceCore>,
    pub client: Arc<Session>,
    pub args: Vec<String>,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, ctx: CommandCtx) -> Result<()>;
}

/// Per-command permission predicate, evaluated against a fresh link state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    Always,
    OnlyUnlinked,
    OnlyLinked,
}

impl Permission {
    pub fn allows(&self, link: LinkState) -> bool {
        match self {
            Permission::Always => true,
            Permission::OnlyUnlinked => !link.is_linked(),
            Permission::OnlyLinked => link.is_linked(),
        }
    }
}

pub struct Command {
    pub usage: Option<String>,
    pub description: Option<String>,
    pub permission: Permission,
    pub handler: Arc<dyn CommandHandler>,
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<IndexMap<String, Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with the built-in command set.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Arc::new(Self::new());
        registry.register(
            "help",
            Command {
                usage: Some("help".into()),
                description: Some("List available proxy commands".into()),
                permission: Permission::Always,
                handler: Arc::new(HelpCommand {
                    registry: Arc::downgrade(&registry),
                }),
            },
        );
        registry.register(
            "link",
            Command {
                usage: Some("link".into()),
                description: Some("Take control of the bot".into()),
                permission: Permission::Always,
                handler: Arc::new(LinkCommand),
            },
        );
        registry.register(
            "unlink",
            Command {
                usage: Some("unlink".into()),
                description: Some("Release control of the bot".into()),
                permission: Permission::Always,
                handler: Arc::new(UnlinkCommand),
            },
        );
        registry.register(
            "view",
            Command {
                usage: Some("view".into()),
                description: Some("See the world through the bot's eyes".into()),
                permission: Permission::Always,
                handler: Arc::new(ViewCommand),
            },
        );
        registry.register(
            "unview",
            Command {
                usage: Some("unview".into()),
                description: Some("Return to free-flying spectator".into()),
                permission: Permission::Always,
                handler: Arc::new(UnviewCommand),
            },
        );
        registry.register(
            "tp",
            Command {
                usage: Some("tp".into()),
                description: Some("Teleport to the bot's location".into()),
                permission: Permission::Always,
                handler: Arc::new(TpCommand),
            },
        );
        registry
    }

    /// Register (or replace) a command. Collisions are last-registration-wins.
    pub fn register(&self, name: impl Into<String>, command: Command) {
        self.commands
            .write()
            .expect("command registry poisoned")
            .insert(name.into(), command);
    }

    /// `(name, usage, description)` for every registered command, in
    /// registration order.
    pub fn describe(&self) -> Vec<(String, Option<String>, Option<String>)> {
        self.commands
            .read()
            .expect("command registry poisoned")
            .iter()
            .map(|(name, cmd)| (name.clone(), cmd.usage.clone(), cmd.description.clone()))
            .collect()
    }

    fn lookup(&self, name: &str) -> Option<(Permission, Arc<dyn CommandHandler>)> {
        self.commands
            .read()
            .expect("command registry poisoned")
            .get(name)
            .map(|cmd| (cmd.permission, Arc::clone(&cmd.handler)))
    }

    /// Run the commands contained in a chat message.
    ///
    /// Returns whether the message was consumed as a command; unconsumed chat
    /// is the caller's to forward. `|`-separated commands run sequentially
    /// with [`COMMAND_CHAIN_DELAY`] between them.
    pub async fn handle_chat(
        &self,
        splice: &Arc<SpliceCore>,
        client: &Arc<Session>,
        message: &str,
        prefix: &str,
    ) -> bool {
        let Some(body) = message.strip_prefix(prefix) else {
            return false;
        };
        let mut handled = false;
        for (index, segment) in body.split('|').enumerate() {
            let mut tokens = segment.split_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            let Some((permission, handler)) = self.lookup(name) else {
                tracing::debug!("unknown command '{}' from {}", name, client.username());
                continue;
            };
            handled = true;
            if index > 0 {
                tokio::time::sleep(COMMAND_CHAIN_DELAY).await;
            }
            // Permission is evaluated against the link state as it is *now*,
            // not as it was when the chain started.
            if !permission.allows(splice.link_state()) {
                client.chat("You cannot use this command right now!");
                continue;
            }
            let ctx = CommandCtx {
                splice: Arc::clone(splice),
                client: Arc::clone(client),
                args: tokens.map(str::to_string).collect(),
            };
            if let Err(error) = handler.run(ctx).await {
                tracing::warn!("command '{}' failed: {:#}", name, error);
                client.chat("Command failed, see the proxy log.");
            }
        }
        handled
    }
}

// ── Built-in commands ───────────────────────────────────────────────────

struct HelpCommand {
    registry: Weak<CommandRegistry>,
}

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn run(&self, ctx: CommandCtx) -> Result<()> {
        let Some(registry) = self.registry.upgrade() else {
            return Ok(());
        };
        for (name, usage, description) in registry.describe() {
            let line = match (usage, description) {
                (Some(usage), Some(description)) => format!("{} — {}", usage, description),
                (_, Some(description)) => format!("{} — {}", name, description),
                _ => name,
            };
            ctx.client.chat(&line);
        }
        Ok(())
    }
}

struct LinkCommand;

#[async_trait]
impl CommandHandler for LinkCommand {
    async fn run(&self, ctx: CommandCtx) -> Result<()> {
        match ctx.splice.link(&ctx.client).await {
            Ok(()) => ctx.client.chat("You are now in control of the bot."),
            Err(message) => ctx.client.chat(&message),
        }
        Ok(())
    }
}

struct UnlinkCommand;

#[async_trait]
impl CommandHandler for UnlinkCommand {
    async fn run(&self, ctx: CommandCtx) -> Result<()> {
        match ctx.splice.unlink(Some(&ctx.client)).await {
            Ok(()) => ctx.client.chat("Returning you to spectator mode."),
            Err(message) => ctx.client.chat(&message),
        }
        Ok(())
    }
}

struct ViewCommand;

#[async_trait]
impl CommandHandler for ViewCommand {
    async fn run(&self, ctx: CommandCtx) -> Result<()> {
        match ctx.splice.ghost().enter_pov(ctx.client.id()) {
            Ok(()) => ctx.client.chat("Now viewing through the bot's eyes."),
            Err(message) => ctx.client.chat(&message),
        }
        Ok(())
    }
}

struct UnviewCommand;

#[async_trait]
impl CommandHandler for UnviewCommand {
    async fn run(&self, ctx: CommandCtx) -> Result<()> {
        match ctx.splice.ghost().exit_pov(ctx.client.id()) {
            Ok(()) => ctx.client.chat("Camera released."),
            Err(message) => ctx.client.chat(&message),
        }
        Ok(())
    }
}

struct TpCommand;

#[async_trait]
impl CommandHandler for TpCommand {
    async fn run(&self, ctx: CommandCtx) -> Result<()> {
        match ctx.splice.ghost().teleport_to_ghost(ctx.client.id()) {
            Ok(()) => ctx.client.chat("Teleported to the bot."),
            Err(message) => ctx.client.chat(&message),
        }
        Ok(())
    }
}
