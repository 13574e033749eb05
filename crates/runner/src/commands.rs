//! Slash-command registry and parser.
//!
//! A message is a command iff it begins with `/` and the first
//! whitespace-delimited token names a registered command. Handlers live on
//! the workspace runner; this module owns the definitions, parsing, and
//! `/help` rendering.

/// Static description of one command.
#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    pub name: &'static str,
    /// Hidden commands are omitted from `/help`.
    pub hidden: bool,
    /// Whether the command skips the queueing machinery entirely.
    pub bypass_queue: bool,
    pub args: Option<&'static str>,
    pub description: &'static str,
}

/// A parsed command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand<'a> {
    pub name: &'a str,
    /// Everything after the command token, trimmed. Empty if no args.
    pub args: &'a str,
}

pub struct CommandRouter {
    defs: Vec<CommandDef>,
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl CommandRouter {
    /// The built-in command surface.
    pub fn with_builtins() -> Self {
        Self {
            defs: vec![
                CommandDef {
                    name: "start",
                    hidden: true,
                    bypass_queue: false,
                    args: None,
                    description: "Show the welcome message",
                },
                CommandDef {
                    name: "new",
                    hidden: false,
                    bypass_queue: true,
                    args: None,
                    description: "Start a new conversation (archives the current one)",
                },
                CommandDef {
                    name: "compact",
                    hidden: false,
                    bypass_queue: true,
                    args: None,
                    description: "Summarize the conversation and carry the summary forward",
                },
                CommandDef {
                    name: "queue",
                    hidden: false,
                    bypass_queue: false,
                    args: Some("<mode>"),
                    description: "Set this session's queue mode (collect, steer, followup, interrupt)",
                },
                CommandDef {
                    name: "status",
                    hidden: false,
                    bypass_queue: false,
                    args: None,
                    description: "Show workspace, conversation, and task status",
                },
                CommandDef {
                    name: "help",
                    hidden: false,
                    bypass_queue: false,
                    args: None,
                    description: "List available commands",
                },
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&CommandDef> {
        self.defs.iter().find(|d| d.name == name)
    }

    /// Parse a leading-slash command, if the first token is registered.
    pub fn parse<'a>(&self, content: &'a str) -> Option<ParsedCommand<'a>> {
        let trimmed = content.trim_start();
        let rest = trimmed.strip_prefix('/')?;
        let token = rest.split_whitespace().next()?;
        self.get(token)?;
        let args = rest[token.len()..].trim();
        Some(ParsedCommand { name: token, args })
    }

    pub fn is_command(&self, content: &str) -> bool {
        self.parse(content).is_some()
    }

    /// Render the non-hidden command list for `/help`.
    pub fn help_text(&self) -> String {
        let mut lines = vec!["Available commands:".to_owned()];
        for def in self.defs.iter().filter(|d| !d.hidden) {
            let usage = match def.args {
                Some(args) => format!("/{} {}", def.name, args),
                None => format!("/{}", def.name),
            };
            lines.push(format!("  {usage} — {}", def.description));
        }
        lines.join("\n")
    }
}
