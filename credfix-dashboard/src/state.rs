use credfix_engine::doctor::session::{DiagnosticSession, SessionStatus};
use credfix_engine::repair::Analysis;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Scanning,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub id: String,
    pub requested_at: OffsetDateTime,
    pub state: ScanState,
    pub session: Option<DiagnosticSession>,
    pub analysis: Option<Analysis>,
}

/// Scans started through the API, newest last
#[derive(Debug)]
pub struct ScanStore {
    records: VecDeque<ScanRecord>,
    history: usize,
}

impl ScanStore {
    pub fn new(history: usize) -> Self {
        Self {
            records: VecDeque::new(),
            history: history.max(1),
        }
    }

    pub fn start(&mut self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.records.push_back(ScanRecord {
            id: id.clone(),
            requested_at: OffsetDateTime::now_utc(),
            state: ScanState::Scanning,
            session: None,
            analysis: None,
        });
        self.evict();
        id
    }

    pub fn complete(&mut self, id: &str, session: DiagnosticSession, analysis: Analysis) {
        let Some(record) = self.records.iter_mut().find(|r| r.id == id) else { return; };
        record.state = match session.status {
            SessionStatus::Failed => ScanState::Failed,
            _ => ScanState::Completed,
        };
        record.session = Some(session);
        record.analysis = Some(analysis);
    }

    pub fn get(&self, id: &str) -> Option<&ScanRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ScanRecord> {
        self.records.iter()
    }

    // running scans are never evicted
    fn evict(&mut self) {
        while self.records.len() > self.history {
            let Some(pos) = self.records.iter().position(|r| r.state != ScanState::Scanning) else { break; };
            self.records.remove(pos);
        }
    }
}
