use crate::models::aggregate::Aggregate;
use crate::models::verdict::{SlaThresholds, Verdict, Violation};

// 纯函数判定：负载模式只报告不中断，压力模式由控制器在首次违反时停止
pub fn evaluate(aggregate: &Aggregate, thresholds: &SlaThresholds) -> Verdict {
    evaluate_values(
        aggregate.p95_ms,
        aggregate.p99_ms,
        aggregate.error_rate_pct,
        aggregate.timeout_rate_pct,
        thresholds,
    )
}

pub fn evaluate_values(
    p95_ms: f64,
    p99_ms: f64,
    error_rate_pct: f64,
    timeout_rate_pct: f64,
    thresholds: &SlaThresholds,
) -> Verdict {
    let mut violations = Vec::new();
    if let Some(limit) = thresholds.p95_ms {
        if p95_ms > limit {
            violations.push(Violation {
                metric: "p95_ms".to_string(),
                observed: p95_ms,
                threshold: limit,
            });
        }
    }
    if let Some(limit) = thresholds.p99_ms {
        if p99_ms > limit {
            violations.push(Violation {
                metric: "p99_ms".to_string(),
                observed: p99_ms,
                threshold: limit,
            });
        }
    }
    if let Some(limit) = thresholds.error_rate_pct {
        if error_rate_pct > limit {
            violations.push(Violation {
                metric: "error_rate_pct".to_string(),
                observed: error_rate_pct,
                threshold: limit,
            });
        }
    }
    if let Some(limit) = thresholds.timeout_rate_pct {
        if timeout_rate_pct > limit {
            violations.push(Violation {
                metric: "timeout_rate_pct".to_string(),
                observed: timeout_rate_pct,
                threshold: limit,
            });
        }
    }
    Verdict { pass: violations.is_empty(), violations }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_when_no_thresholds() {
        let v = evaluate_values(100.0, 200.0, 50.0, 50.0, &SlaThresholds::default());
        assert!(v.pass);
        assert!(v.violations.is_empty());
    }

    #[test]
    fn test_violation_records_observed_and_threshold() {
        let thresholds = SlaThresholds {
            p95_ms: Some(5.0),
            ..SlaThresholds::default()
        };
        let v = evaluate_values(20.0, 25.0, 0.0, 0.0, &thresholds);
        assert!(!v.pass);
        assert_eq!(v.violations.len(), 1);
        assert_eq!(v.violations[0].metric, "p95_ms");
        assert!((v.violations[0].observed - 20.0).abs() < 1e-9);
        assert!((v.violations[0].threshold - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_boundary_is_not_a_violation() {
        let thresholds = SlaThresholds {
            p95_ms: Some(50.0),
            error_rate_pct: Some(1.0),
            ..SlaThresholds::default()
        };
        let v = evaluate_values(50.0, 0.0, 1.0, 0.0, &thresholds);
        assert!(v.pass);
    }

    #[test]
    fn test_multiple_violations_all_listed() {
        let thresholds = SlaThresholds {
            p95_ms: Some(10.0),
            p99_ms: Some(10.0),
            error_rate_pct: Some(0.5),
            timeout_rate_pct: Some(0.5),
        };
        let v = evaluate_values(20.0, 30.0, 1.0, 1.0, &thresholds);
        assert_eq!(v.violations.len(), 4);
    }
}
