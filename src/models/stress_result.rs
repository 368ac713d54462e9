use serde::Serialize;

// 单个压力阶段的统计窗口
#[derive(Debug, Clone, Serialize)]
pub struct PhaseResult {
    pub phase: usize,
    pub target_users: u32,
    // 阶段内实际达到的最大并发
    pub reached_users: u32,
    pub duration_seconds: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub timeout_count: u64,
    pub tps: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate_pct: f64,
    pub timeout_rate_pct: f64,
    pub breached: bool,
    pub breach_reason: String,
}

// 完整压力测试结果
#[derive(Debug, Clone, Serialize)]
pub struct StressResult {
    pub phases: Vec<PhaseResult>,
    // 0表示在max_users内未触达
    pub breaking_point_users: u32,
    pub max_sustainable_load_users: u32,
    pub first_error_at_users: u32,
    pub nonlinear_latency_at_users: u32,
    pub scenario: String,
    pub collection_name: String,
    pub started_at_ms: u128,
    pub ended_at_ms: u128,
}
