use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

/// Phases of the deploy pipeline. `Failed` is reachable from any of them.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Fetching,
    Prebuild,
    Building,
    Postbuild,
    Spawning,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DeployEventKind {
    PhaseStarted {
        phase: DeployPhase,
    },
    PhaseCompleted {
        phase: DeployPhase,
        duration_secs: f64,
    },
    PhaseSkipped {
        phase: DeployPhase,
        reason: String,
    },
    BuilderDetected {
        builder: String,
    },
    WorkersChanged {
        created: Vec<String>,
        destroyed: Vec<String>,
    },
    DeployFailed {
        phase: DeployPhase,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: DeployEventKind,
}

/// Record of one deploy run, printed by `deploy --json`.
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub deploy_id: Uuid,
    pub app: String,
    pub newrev: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase: DeployPhase,
    pub builders: Vec<String>,
    pub events: Vec<DeployEvent>,
    #[serde(skip)]
    phase_started: Option<Instant>,
}

impl DeployReport {
    pub fn new(app: impl Into<String>, newrev: Option<&str>) -> Self {
        Self {
            deploy_id: Uuid::new_v4(),
            app: app.into(),
            newrev: newrev.map(str::to_string),
            started_at: Utc::now(),
            finished_at: None,
            phase: DeployPhase::Fetching,
            builders: Vec::new(),
            events: Vec::new(),
            phase_started: None,
        }
    }

    pub fn emit(&mut self, kind: DeployEventKind) {
        self.events.push(DeployEvent {
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn begin(&mut self, phase: DeployPhase) {
        self.phase = phase;
        self.phase_started = Some(Instant::now());
        self.emit(DeployEventKind::PhaseStarted { phase });
    }

    pub fn complete(&mut self) {
        let duration_secs = self
            .phase_started
            .take()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        let phase = self.phase;
        self.emit(DeployEventKind::PhaseCompleted { phase, duration_secs });
    }

    pub fn skip(&mut self, phase: DeployPhase, reason: impl Into<String>) {
        self.emit(DeployEventKind::PhaseSkipped {
            phase,
            reason: reason.into(),
        });
    }

    pub fn builder_detected(&mut self, builder: &str) {
        self.builders.push(builder.to_string());
        self.emit(DeployEventKind::BuilderDetected {
            builder: builder.to_string(),
        });
    }

    pub fn fail(&mut self, error: &str) {
        let phase = self.phase;
        self.emit(DeployEventKind::DeployFailed {
            phase,
            error: error.to_string(),
        });
        self.phase = DeployPhase::Failed;
        self.finished_at = Some(Utc::now());
    }

    pub fn finish(&mut self) {
        self.phase = DeployPhase::Done;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.phase == DeployPhase::Done
    }
}
