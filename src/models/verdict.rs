use serde::Serialize;

use crate::models::config::{ScenarioConfig, StressConfig};

// SLA阈值，None表示不检查该项
#[derive(Debug, Clone, Default)]
pub struct SlaThresholds {
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub error_rate_pct: Option<f64>,
    pub timeout_rate_pct: Option<f64>,
}

impl SlaThresholds {
    pub fn is_empty(&self) -> bool {
        self.p95_ms.is_none()
            && self.p99_ms.is_none()
            && self.error_rate_pct.is_none()
            && self.timeout_rate_pct.is_none()
    }
}

impl From<&ScenarioConfig> for SlaThresholds {
    fn from(config: &ScenarioConfig) -> Self {
        SlaThresholds {
            p95_ms: config.sla_p95_ms,
            p99_ms: config.sla_p99_ms,
            error_rate_pct: config.sla_error_rate_pct,
            timeout_rate_pct: None,
        }
    }
}

impl From<&StressConfig> for SlaThresholds {
    fn from(config: &StressConfig) -> Self {
        SlaThresholds {
            p95_ms: Some(config.sla_p95_ms),
            p99_ms: Some(config.sla_p99_ms),
            error_rate_pct: Some(config.sla_error_rate_pct),
            timeout_rate_pct: Some(config.sla_timeout_rate_pct),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub metric: String,
    pub observed: f64,
    pub threshold: f64,
}

impl Violation {
    pub fn describe(&self) -> String {
        format!("{} {:.2} > SLA {:.2}", self.metric, self.observed, self.threshold)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub pass: bool,
    pub violations: Vec<Violation>,
}

impl Verdict {
    pub fn passing() -> Self {
        Verdict { pass: true, violations: Vec::new() }
    }
}
