//! Slash commands accepted by the REPL.
//!
//! Parsing only; the binary decides what each command does.

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub usage: &'static str,
    pub help_label: &'static str,
    pub description: &'static str,
    pub show_in_help: bool,
}

const COMMAND_SPECS: &[CommandSpec] = &[
    CommandSpec {
        usage: "exit, quit",
        help_label: "exit",
        description: "Save and leave the session",
        show_in_help: true,
    },
    CommandSpec {
        usage: "clear",
        help_label: "clear",
        description: "Clear conversation history (keeps the system prompt)",
        show_in_help: true,
    },
    CommandSpec {
        usage: "sessions",
        help_label: "sessions",
        description: "List saved sessions",
        show_in_help: true,
    },
    CommandSpec {
        usage: "delete <id>",
        help_label: "delete",
        description: "Delete another saved session",
        show_in_help: true,
    },
    CommandSpec {
        usage: "rename <name>",
        help_label: "rename",
        description: "Rename this session",
        show_in_help: true,
    },
    CommandSpec {
        usage: "stats",
        help_label: "stats",
        description: "Show strategy and token statistics",
        show_in_help: true,
    },
    CommandSpec {
        usage: "compression [on|off|status]",
        help_label: "compression",
        description: "Toggle sliding-window compression",
        show_in_help: true,
    },
    CommandSpec {
        usage: "facts [reset]",
        help_label: "facts",
        description: "Show remembered facts, or forget them all",
        show_in_help: true,
    },
    CommandSpec {
        usage: "checkpoint [name]",
        help_label: "checkpoint",
        description: "Mark the current point of the conversation",
        show_in_help: true,
    },
    CommandSpec {
        usage: "branch [list|create <checkpoint> [name]|switch <branch|main>]",
        help_label: "branch",
        description: "List, create or switch branches",
        show_in_help: true,
    },
    CommandSpec {
        usage: "experts <question>",
        help_label: "experts",
        description: "Ask the expert panel in parallel",
        show_in_help: true,
    },
    CommandSpec {
        usage: "help",
        help_label: "help",
        description: "Show available commands",
        show_in_help: false,
    },
];

#[must_use]
pub fn command_specs() -> &'static [CommandSpec] {
    COMMAND_SPECS
}

#[must_use]
pub fn command_help_summary() -> String {
    let labels: Vec<&str> = COMMAND_SPECS
        .iter()
        .filter(|spec| spec.show_in_help)
        .map(|spec| spec.help_label)
        .collect();
    format!("Commands: /{}", labels.join(", /"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionArg {
    On,
    Off,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCommand<'a> {
    List,
    Create {
        checkpoint: &'a str,
        name: Option<&'a str>,
    },
    Switch(&'a str),
    /// Recognised subcommand with missing arguments, or an unknown one.
    Invalid(&'a str),
}

/// Parsed command with typed arguments.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Exit,
    Clear,
    Sessions,
    Delete(Option<&'a str>),
    Rename(Option<&'a str>),
    Stats,
    Compression(Option<CompressionArg>),
    Facts(Option<&'a str>),
    Checkpoint(Option<&'a str>),
    Branch(BranchCommand<'a>),
    Experts(Option<&'a str>),
    Help,
    Unknown(&'a str),
    Empty,
}

/// Split off the first word; the rest is trimmed and `None` when empty.
fn head_rest(raw: &str) -> (Option<&str>, Option<&str>) {
    let raw = raw.trim();
    if raw.is_empty() {
        return (None, None);
    }
    match raw.split_once(char::is_whitespace) {
        Some((head, rest)) => {
            let rest = rest.trim();
            (Some(head), (!rest.is_empty()).then_some(rest))
        }
        None => (Some(raw), None),
    }
}

impl<'a> Command<'a> {
    /// Parse the text after the leading `/`.
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        let (head, rest) = head_rest(raw);
        match head {
            Some("exit" | "quit" | "q") => Command::Exit,
            Some("clear") => Command::Clear,
            Some("sessions") => Command::Sessions,
            Some("delete") => Command::Delete(rest),
            Some("rename") => Command::Rename(rest),
            Some("stats") => Command::Stats,
            Some("compression") => Command::Compression(match rest {
                None | Some("status") => Some(CompressionArg::Status),
                Some("on") => Some(CompressionArg::On),
                Some("off") => Some(CompressionArg::Off),
                Some(_) => None,
            }),
            Some("facts") => Command::Facts(rest),
            Some("checkpoint" | "cp") => Command::Checkpoint(rest),
            Some("branch" | "br") => Command::Branch(parse_branch(rest)),
            Some("experts") => Command::Experts(rest),
            Some("help") => Command::Help,
            Some(cmd) => Command::Unknown(cmd),
            None => Command::Empty,
        }
    }
}

fn parse_branch(rest: Option<&str>) -> BranchCommand<'_> {
    let Some(rest) = rest else {
        return BranchCommand::List;
    };
    let (sub, args) = head_rest(rest);
    match (sub, args) {
        (Some("list"), _) => BranchCommand::List,
        (Some("create"), Some(args)) => {
            let (checkpoint, name) = head_rest(args);
            match checkpoint {
                Some(checkpoint) => BranchCommand::Create { checkpoint, name },
                None => BranchCommand::Invalid("create"),
            }
        }
        (Some("switch"), Some(target)) => BranchCommand::Switch(target),
        (Some(sub), _) => BranchCommand::Invalid(sub),
        (None, _) => BranchCommand::List,
    }
}
