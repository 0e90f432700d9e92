//! Hand-off point between a running sync and the review pages.
//!
//! The sync side owns a [`WebOperator`] and blocks on each prompt until an answer arrives.
//! Handlers read the single pending prompt and submit answers for it. Submitting takes the
//! prompt under the same lock that sends the answers, so one prompt is never answered twice.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use grantsync_core::{
    ActionChoice, CandidateView, EntityKind, OperatorPort, OperatorReply, PromptRequest,
    TargetPurpose,
};
use grantsync_sync::SyncRunSummary;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

pub const DUPLICATE_OPTIONS: [&str; 4] = ["Insert new", "Skip", "Update", "Show details"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "prompt", rename_all = "snake_case")]
pub enum Pending {
    Region {
        city: String,
        options: Vec<String>,
    },
    Province {
        company: String,
    },
    Duplicate {
        kind: EntityKind,
        name: String,
        contact: String,
        matches: Vec<CandidateView>,
    },
    Target {
        kind: EntityKind,
        purpose: TargetPurpose,
        matches: Vec<CandidateView>,
    },
}

impl From<&PromptRequest<'_>> for Pending {
    fn from(request: &PromptRequest<'_>) -> Self {
        match request {
            PromptRequest::Region { city, options } => Pending::Region {
                city: city.to_string(),
                options: options.iter().map(|o| o.to_string()).collect(),
            },
            PromptRequest::Province { company } => Pending::Province {
                company: company.to_string(),
            },
            PromptRequest::Action {
                kind,
                label,
                contact,
                candidates,
            } => Pending::Duplicate {
                kind: *kind,
                name: label.to_string(),
                contact: contact.to_string(),
                matches: candidates.to_vec(),
            },
            PromptRequest::Target {
                kind,
                purpose,
                candidates,
            } => Pending::Target {
                kind: *kind,
                purpose: *purpose,
                matches: candidates.to_vec(),
            },
        }
    }
}

/// The open prompt plus whatever the sync showed since the previous one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPrompt {
    #[serde(flatten)]
    pub pending: Pending,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionDecision {
    pub city: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvinceDecision {
    pub company: String,
    pub province: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateDecision {
    pub name: String,
    pub action: ActionChoice,
    pub target_id: Option<String>,
}

/// Every decision taken through the desk, and how the run ended.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeskSummary {
    pub cities: Vec<RegionDecision>,
    pub provinces: Vec<ProvinceDecision>,
    pub people: Vec<DuplicateDecision>,
    pub companies: Vec<DuplicateDecision>,
    pub run: Option<SyncRunSummary>,
    pub error: Option<String>,
}

impl DeskSummary {
    pub fn decision_count(&self) -> usize {
        self.cities.len() + self.provinces.len() + self.people.len() + self.companies.len()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeskError {
    #[error("no {0} decision is pending")]
    NothingPending(&'static str),
    #[error("pending {field} is '{pending}', not '{given}'")]
    Mismatch {
        field: &'static str,
        pending: String,
        given: String,
    },
    #[error("invalid answer '{answer}': {hint}")]
    Invalid { answer: String, hint: &'static str },
    #[error("target_id must name one of the displayed matches")]
    UnknownTarget,
    #[error("the sync run is no longer waiting for answers")]
    Closed,
}

#[derive(Default)]
struct DeskState {
    pending: Option<PendingPrompt>,
    unread: Vec<String>,
    summary: DeskSummary,
    finished: bool,
    answers: Option<UnboundedSender<String>>,
}

impl DeskState {
    /// Sends `answers` for the pending prompt and takes it.
    fn deliver(&mut self, answers: &[String]) -> Result<(), DeskError> {
        let sender = self.answers.as_ref().ok_or(DeskError::Closed)?;
        for answer in answers {
            sender.send(answer.clone()).map_err(|_| DeskError::Closed)?;
        }
        self.pending = None;
        Ok(())
    }
}

pub struct ReviewDesk {
    state: Mutex<DeskState>,
}

impl ReviewDesk {
    /// A desk and the operator the sync run answers through.
    pub fn open() -> (Arc<ReviewDesk>, WebOperator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let desk = Arc::new(ReviewDesk {
            state: Mutex::new(DeskState {
                answers: Some(tx),
                ..Default::default()
            }),
        });
        let operator = WebOperator {
            desk: Arc::clone(&desk),
            answers: rx,
        };
        (desk, operator)
    }

    fn lock(&self) -> MutexGuard<'_, DeskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending(&self) -> Option<PendingPrompt> {
        self.lock().pending.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn summary(&self) -> DeskSummary {
        self.lock().summary.clone()
    }

    pub fn assign_region(&self, city: &str, region: &str) -> Result<RegionDecision, DeskError> {
        let mut state = self.lock();
        let Some(PendingPrompt {
            pending: Pending::Region {
                city: pending_city,
                options,
            },
            ..
        }) = &state.pending
        else {
            return Err(DeskError::NothingPending("region"));
        };
        if pending_city != city {
            return Err(DeskError::Mismatch {
                field: "city",
                pending: pending_city.clone(),
                given: city.to_string(),
            });
        }
        let offered: Vec<&str> = options.iter().map(String::as_str).collect();
        let reply = PromptRequest::Region {
            city,
            options: &offered,
        }
        .interpret(region);
        let OperatorReply::Region(code) = reply else {
            return Err(DeskError::Invalid {
                answer: region.to_string(),
                hint: "please enter NE, NW, SE, or SW",
            });
        };

        state.deliver(&[code.clone()])?;
        let decision = RegionDecision {
            city: city.to_string(),
            region: code,
        };
        info!(city, region = %decision.region, "region assigned from review desk");
        state.summary.cities.push(decision.clone());
        Ok(decision)
    }

    pub fn assign_province(
        &self,
        company: &str,
        province: &str,
    ) -> Result<ProvinceDecision, DeskError> {
        let mut state = self.lock();
        let Some(PendingPrompt {
            pending: Pending::Province {
                company: pending_company,
            },
            ..
        }) = &state.pending
        else {
            return Err(DeskError::NothingPending("province"));
        };
        if pending_company != company {
            return Err(DeskError::Mismatch {
                field: "company",
                pending: pending_company.clone(),
                given: company.to_string(),
            });
        }
        let OperatorReply::Province(code) =
            PromptRequest::Province { company }.interpret(province)
        else {
            return Err(DeskError::Invalid {
                answer: province.to_string(),
                hint: "a province code such as NB or NS is required",
            });
        };

        state.deliver(&[code.clone()])?;
        let decision = ProvinceDecision {
            company: company.to_string(),
            province: code,
        };
        info!(company, province = %decision.province, "province assigned from review desk");
        state.summary.provinces.push(decision.clone());
        Ok(decision)
    }

    /// Answers the pending duplicate menu for `kind`. Skip and update also answer the
    /// follow-up target question when more than one match is displayed.
    pub fn resolve_duplicate(
        &self,
        kind: EntityKind,
        choice: u8,
        target_id: Option<&str>,
    ) -> Result<ActionChoice, DeskError> {
        let mut state = self.lock();
        let (name, matches) = match &state.pending {
            Some(PendingPrompt {
                pending:
                    Pending::Duplicate {
                        kind: pending_kind,
                        name,
                        matches,
                        ..
                    },
                ..
            }) if *pending_kind == kind => (name.clone(), matches.clone()),
            _ => return Err(DeskError::NothingPending(kind.as_str())),
        };
        let action = ActionChoice::from_number(choice).ok_or_else(|| DeskError::Invalid {
            answer: choice.to_string(),
            hint: "please enter 1, 2, 3, or 4",
        })?;

        let mut answers = vec![choice.to_string()];
        let mut target = None;
        if action.needs_target() {
            let position = match (target_id, matches.as_slice()) {
                (Some(id), _) => matches
                    .iter()
                    .position(|m| m.id == id)
                    .ok_or(DeskError::UnknownTarget)?,
                (None, [_only]) => 0,
                (None, _) => return Err(DeskError::UnknownTarget),
            };
            if matches.len() > 1 {
                answers.push((position + 1).to_string());
            }
            target = Some(matches[position].id.clone());
        }

        state.deliver(&answers)?;
        if action != ActionChoice::Details {
            info!(
                %kind,
                name = %name,
                ?action,
                target = target.as_deref().unwrap_or(""),
                "duplicate resolved from review desk"
            );
            let decision = DuplicateDecision {
                name,
                action,
                target_id: target,
            };
            match kind {
                EntityKind::Person => state.summary.people.push(decision),
                _ => state.summary.companies.push(decision),
            }
        }
        Ok(action)
    }

    /// Records the finished run and stops accepting answers.
    pub fn complete(&self, summary: SyncRunSummary) {
        let mut state = self.lock();
        state.summary.run = Some(summary);
        state.finished = true;
        state.answers = None;
    }

    /// Records a failed run and stops accepting answers. A blocked operator sees end of input.
    pub fn fail(&self, message: String) {
        warn!(error = %message, "sync run ended with an error");
        let mut state = self.lock();
        state.summary.error = Some(message);
        state.finished = true;
        state.answers = None;
    }
}

/// Operator whose answers come from the review desk.
pub struct WebOperator {
    desk: Arc<ReviewDesk>,
    answers: UnboundedReceiver<String>,
}

impl OperatorPort for WebOperator {
    fn show(&mut self, text: &str) {
        self.desk.lock().unread.push(text.to_string());
    }

    /// Blocks the calling thread; call it off the async workers.
    fn ask(&mut self, request: &PromptRequest<'_>) -> io::Result<OperatorReply> {
        {
            let mut state = self.desk.lock();
            let messages = std::mem::take(&mut state.unread);
            state.pending = Some(PendingPrompt {
                pending: Pending::from(request),
                messages,
            });
        }
        info!(prompt = request.kind_name(), "waiting for a review decision");
        let raw = self.answers.blocking_recv();
        self.desk.lock().pending = None;
        let raw = raw.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "review desk closed")
        })?;
        Ok(request.interpret(&raw))
    }
}
