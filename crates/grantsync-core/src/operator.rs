//! Synchronous operator interaction port.
//!
//! The resolver and the field mapper never read stdin directly; they hand a structured
//! [`PromptRequest`] to an [`OperatorPort`] and get back an [`OperatorReply`]. Raw answers
//! are interpreted against the request that asked for them, so every front end (terminal,
//! web desk, test script) agrees on what counts as a valid answer, while re-prompting on
//! [`OperatorReply::Unrecognized`] stays in the caller's state machine.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use serde::Serialize;

use crate::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetPurpose {
    Duplicate,
    Update,
}

/// One displayed duplicate candidate, as the operator sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateView {
    pub id: String,
    pub name: String,
    pub contact: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromptRequest<'a> {
    /// Insert / skip / update / details menu for one incoming entity.
    Action {
        kind: EntityKind,
        label: &'a str,
        contact: &'a str,
        candidates: &'a [CandidateView],
    },
    /// Pick one of the displayed candidates (1-based).
    Target {
        kind: EntityKind,
        purpose: TargetPurpose,
        candidates: &'a [CandidateView],
    },
    Region { city: &'a str, options: &'a [&'a str] },
    Province { company: &'a str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionChoice {
    Insert,
    Skip,
    Update,
    Details,
}

impl ActionChoice {
    /// Menu number shown to the operator.
    pub fn number(&self) -> u8 {
        match self {
            ActionChoice::Insert => 1,
            ActionChoice::Skip => 2,
            ActionChoice::Update => 3,
            ActionChoice::Details => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(ActionChoice::Insert),
            2 => Some(ActionChoice::Skip),
            3 => Some(ActionChoice::Update),
            4 => Some(ActionChoice::Details),
            _ => None,
        }
    }

    /// Skip and update both need a target among the displayed candidates.
    pub fn needs_target(&self) -> bool {
        matches!(self, ActionChoice::Skip | ActionChoice::Update)
    }
}

/// An operator answer, already checked against the prompt it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorReply {
    Action(ActionChoice),
    /// 1-based position among the displayed candidates.
    Target(usize),
    /// A number outside the displayed candidate range.
    OutOfRange(usize),
    /// Upper-cased region code from the offered options.
    Region(String),
    /// Upper-cased province code.
    Province(String),
    Unrecognized(String),
}

impl PromptRequest<'_> {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PromptRequest::Action { .. } => "action",
            PromptRequest::Target { .. } => "target",
            PromptRequest::Region { .. } => "region",
            PromptRequest::Province { .. } => "province",
        }
    }

    pub fn text(&self) -> String {
        match self {
            PromptRequest::Action { kind, .. } => format!(
                "\nWhat would you like to do?\n\
                 1. Insert as new {kind}\n\
                 2. Skip (it's a duplicate)\n\
                 3. Update existing record\n\
                 4. Show more details\n\
                 Enter choice (1-4): "
            ),
            PromptRequest::Target { candidates, .. } => {
                format!("Enter number (1-{}): ", candidates.len())
            }
            PromptRequest::Region { city, options } => {
                format!("Enter region for city '{city}' ({}): ", options.join("/"))
            }
            PromptRequest::Province { company } => {
                format!("Enter province for company '{company}' (NB, NS, etc.): ")
            }
        }
    }

    /// Reads a raw answer the way this prompt expects it.
    pub fn interpret(&self, raw: &str) -> OperatorReply {
        let answer = raw.trim();
        match self {
            PromptRequest::Action { .. } => answer
                .parse::<u8>()
                .ok()
                .and_then(ActionChoice::from_number)
                .map(OperatorReply::Action)
                .unwrap_or_else(|| OperatorReply::Unrecognized(answer.to_string())),
            PromptRequest::Target { candidates, .. } => match answer.parse::<usize>() {
                Ok(n) if (1..=candidates.len()).contains(&n) => OperatorReply::Target(n),
                Ok(n) => OperatorReply::OutOfRange(n),
                Err(_) => OperatorReply::Unrecognized(answer.to_string()),
            },
            PromptRequest::Region { options, .. } => {
                let code = answer.to_uppercase();
                if options.contains(&code.as_str()) {
                    OperatorReply::Region(code)
                } else {
                    OperatorReply::Unrecognized(answer.to_string())
                }
            }
            PromptRequest::Province { .. } if answer.is_empty() => {
                OperatorReply::Unrecognized(String::new())
            }
            PromptRequest::Province { .. } => OperatorReply::Province(answer.to_uppercase()),
        }
    }
}

/// Blocking operator channel. End of input surfaces as `UnexpectedEof`.
pub trait OperatorPort: Send {
    fn show(&mut self, text: &str);
    fn ask(&mut self, request: &PromptRequest<'_>) -> io::Result<OperatorReply>;
}

/// Terminal operator on stdin/stdout.
#[derive(Debug, Default)]
pub struct StdioOperator;

impl OperatorPort for StdioOperator {
    fn show(&mut self, text: &str) {
        println!("{text}");
    }

    fn ask(&mut self, request: &PromptRequest<'_>) -> io::Result<OperatorReply> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(request.text().as_bytes())?;
        stdout.flush()?;
        drop(stdout);

        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "operator input closed",
            ));
        }
        Ok(request.interpret(&line))
    }
}

/// Replays canned replies in order and records every prompt and message.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    replies: VecDeque<String>,
    pub shown: Vec<String>,
    pub asked: Vec<String>,
}

impl ScriptedOperator {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            shown: Vec::new(),
            asked: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.replies.len()
    }
}

impl OperatorPort for ScriptedOperator {
    fn show(&mut self, text: &str) {
        self.shown.push(text.to_string());
    }

    fn ask(&mut self, request: &PromptRequest<'_>) -> io::Result<OperatorReply> {
        self.asked.push(request.text());
        let raw = self.replies.pop_front().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "operator script exhausted")
        })?;
        Ok(request.interpret(&raw))
    }
}
