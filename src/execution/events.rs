//! Controller events and handler registry

use crate::core::{Revision, Stage, TriggerSource};
use crate::gate::QualityGateResult;
use crate::promotion::PromotionResult;
use std::sync::Arc;

/// Events that can occur while the controller runs stages
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    StageStarted {
        stage: Stage,
        revision: Revision,
        attempt: u32,
        trigger: TriggerSource,
    },
    StageSkipped {
        stage: Stage,
        revision: Revision,
        reason: String,
    },
    StepStarted {
        stage: Stage,
        step: String,
    },
    GateEvaluated {
        stage: Stage,
        result: QualityGateResult,
    },
    ValidationFinished {
        stage: Stage,
        target: String,
        passed: bool,
        failures: Vec<String>,
    },
    Promoted {
        stage: Stage,
        result: PromotionResult,
    },
    StageSucceeded {
        stage: Stage,
        revision: Revision,
        next_stage: Option<Stage>,
    },
    StageFailed {
        stage: Stage,
        revision: Revision,
        error: String,
        requires_operator: bool,
    },
    StageCancelled {
        stage: Stage,
        revision: Revision,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ControllerEvent) + Send + Sync>;

/// Ordered set of handlers that receive every event
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Vec<EventHandler>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler<F>(&mut self, handler: F)
    where
        F: Fn(ControllerEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Arc::new(handler));
    }

    pub fn emit(&self, event: ControllerEvent) {
        for handler in &self.handlers {
            handler(event.clone());
        }
    }
}
