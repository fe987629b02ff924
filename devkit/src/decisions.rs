/*!
Scripted decision provider and recording event sink

Lets the doctor run unattended in tests while keeping a record of what it
asked and what it emitted.
*/

use async_trait::async_trait;
use credfix_engine::consent::backup::BackupRecord;
use credfix_engine::consent::{ConsentDecision, ConsentPrompt, FixProposal};
use credfix_engine::doctor::events::{EventSink, EventType, ProgressEvent};
use credfix_engine::doctor::session::DiagnosticSession;
use credfix_engine::doctor::{DecisionProvider, OptionChoice, SummaryChoice};
use credfix_engine::repair::{Analysis, ExecutionReport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct ScriptedDecisions {
    summary: SummaryChoice,
    option: OptionChoice,
    approve: bool,
    restore_on_failure: bool,
    proposals: Mutex<Vec<FixProposal>>,
    reports: AtomicUsize,
}

impl ScriptedDecisions {
    /// Review, fix everything, approve
    pub fn fix_all() -> Self {
        Self {
            summary: SummaryChoice::ReviewIndividually,
            option: OptionChoice::AutoFixAll,
            approve: true,
            restore_on_failure: false,
            proposals: Mutex::new(Vec::new()),
            reports: AtomicUsize::new(0),
        }
    }

    /// Like `fix_all`, but the proposal is declined
    pub fn rejecting() -> Self {
        Self {
            approve: false,
            ..Self::fix_all()
        }
    }

    pub fn with_summary(mut self, summary: SummaryChoice) -> Self {
        self.summary = summary;
        self
    }

    pub fn with_option(mut self, option: OptionChoice) -> Self {
        self.option = option;
        self
    }

    pub fn restoring_on_failure(mut self) -> Self {
        self.restore_on_failure = true;
        self
    }

    pub fn proposals(&self) -> Vec<FixProposal> {
        self.proposals.lock().unwrap().clone()
    }

    pub fn reports_shown(&self) -> usize {
        self.reports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsentPrompt for ScriptedDecisions {
    async fn on_proposal(&self, proposal: &FixProposal) -> ConsentDecision {
        self.proposals.lock().unwrap().push(proposal.clone());
        log::info!("📝 Proposal {} ({} fixes, risk {})", proposal.id, proposal.fix_ids.len(), proposal.risk);
        if self.approve {
            ConsentDecision::approve("scripted approval")
        } else {
            ConsentDecision::reject("scripted rejection")
        }
    }
}

#[async_trait]
impl DecisionProvider for ScriptedDecisions {
    async fn on_summary(&self, _session: &DiagnosticSession) -> SummaryChoice {
        self.summary
    }

    async fn on_options(&self, _analysis: &Analysis) -> OptionChoice {
        self.option.clone()
    }

    async fn on_report(&self, _session: &DiagnosticSession, _analysis: &Analysis) {
        self.reports.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_failed_fixes(&self, _report: &ExecutionReport, _backup: &BackupRecord) -> bool {
        self.restore_on_failure
    }
}

/// Keeps every emitted event in order
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<ProgressEvent> {
        self.events().into_iter().filter(|e| e.event_type == event_type).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
