use std::fmt;
use std::path::Path;

use anyhow::{Context, Error, Result};
use serde::{Deserialize, Deserializer, Serialize};

// 负载测试的压力曲线
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadScenario {
    Constant,
    Gradual,
    Spike,
}

impl LoadScenario {
    // 未知场景回退到constant
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "gradual" => LoadScenario::Gradual,
            "spike" => LoadScenario::Spike,
            _ => LoadScenario::Constant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadScenario::Constant => "constant",
            LoadScenario::Gradual => "gradual",
            LoadScenario::Spike => "spike",
        }
    }
}

impl fmt::Display for LoadScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LoadScenario {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(LoadScenario::parse(&s))
    }
}

// 压力测试的阶段策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StressScenario {
    LinearOverload,
    SpikeStress,
    SoakStress,
}

impl StressScenario {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "spike_stress" => StressScenario::SpikeStress,
            "soak_stress" => StressScenario::SoakStress,
            _ => StressScenario::LinearOverload,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StressScenario::LinearOverload => "linear_overload",
            StressScenario::SpikeStress => "spike_stress",
            StressScenario::SoakStress => "soak_stress",
        }
    }
}

impl fmt::Display for StressScenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StressScenario {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(StressScenario::parse(&s))
    }
}

// 负载测试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub users: u32,
    pub ramp_up_seconds: f64,
    pub duration_seconds: f64,
    // 0表示跑满duration，>0表示每个VU跑N轮后退出
    pub iterations: u64,
    pub think_time_ms: u64,
    pub scenario: LoadScenario,
    pub spike_users: u32,
    pub spike_duration_seconds: f64,
    pub sla_p95_ms: Option<f64>,
    pub sla_p99_ms: Option<f64>,
    pub sla_error_rate_pct: Option<f64>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            users: 10,
            ramp_up_seconds: 10.0,
            duration_seconds: 60.0,
            iterations: 0,
            think_time_ms: 0,
            scenario: LoadScenario::Constant,
            spike_users: 0,
            spike_duration_seconds: 0.0,
            sla_p95_ms: None,
            sla_p99_ms: None,
            sla_error_rate_pct: None,
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<()> {
        if self.users < 1 {
            return Err(Error::msg("users must be >= 1"));
        }
        if self.duration_seconds <= 0.0 {
            return Err(Error::msg("duration_seconds must be > 0"));
        }
        if self.ramp_up_seconds < 0.0 {
            return Err(Error::msg("ramp_up_seconds must be >= 0"));
        }
        if self.spike_duration_seconds < 0.0 {
            return Err(Error::msg("spike_duration_seconds must be >= 0"));
        }
        if let Some(v) = self.sla_p95_ms {
            if v <= 0.0 {
                return Err(Error::msg("sla_p95_ms must be > 0 when set"));
            }
        }
        if let Some(v) = self.sla_p99_ms {
            if v <= 0.0 {
                return Err(Error::msg("sla_p99_ms must be > 0 when set"));
            }
        }
        if let Some(v) = self.sla_error_rate_pct {
            if !(0.0..=100.0).contains(&v) {
                return Err(Error::msg("sla_error_rate_pct must be between 0 and 100 when set"));
            }
        }
        if self.scenario == LoadScenario::Spike
            && (self.spike_users == 0 || self.spike_duration_seconds <= 0.0)
        {
            return Err(Error::msg(
                "spike scenario requires spike_users > 0 and spike_duration_seconds > 0",
            ));
        }
        Ok(())
    }

    pub fn has_sla(&self) -> bool {
        self.sla_p95_ms.is_some() || self.sla_p99_ms.is_some() || self.sla_error_rate_pct.is_some()
    }
}

// 压力测试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub scenario: StressScenario,
    pub initial_users: u32,
    pub step_users: u32,
    pub step_interval_seconds: f64,
    pub max_users: u32,
    pub think_time_ms: u64,
    pub spike_users: u32,
    pub spike_hold_seconds: f64,
    pub soak_users: u32,
    pub soak_duration_seconds: f64,
    pub sla_p95_ms: f64,
    pub sla_p99_ms: f64,
    pub sla_error_rate_pct: f64,
    pub sla_timeout_rate_pct: f64,
}

impl Default for StressConfig {
    fn default() -> Self {
        StressConfig {
            scenario: StressScenario::LinearOverload,
            initial_users: 5,
            step_users: 5,
            step_interval_seconds: 30.0,
            max_users: 200,
            think_time_ms: 0,
            spike_users: 0,
            spike_hold_seconds: 30.0,
            soak_users: 0,
            soak_duration_seconds: 60.0,
            sla_p95_ms: 500.0,
            sla_p99_ms: 1000.0,
            sla_error_rate_pct: 1.0,
            sla_timeout_rate_pct: 5.0,
        }
    }
}

impl StressConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sla_p95_ms <= 0.0 || self.sla_p99_ms <= 0.0 {
            return Err(Error::msg("sla_p95_ms and sla_p99_ms must be > 0"));
        }
        if !(0.0..=100.0).contains(&self.sla_error_rate_pct) {
            return Err(Error::msg("sla_error_rate_pct must be between 0 and 100"));
        }
        if !(0.0..=100.0).contains(&self.sla_timeout_rate_pct) {
            return Err(Error::msg("sla_timeout_rate_pct must be between 0 and 100"));
        }
        if self.initial_users < 1 {
            return Err(Error::msg("initial_users must be >= 1"));
        }
        if self.step_users < 1 {
            return Err(Error::msg("step_users must be >= 1"));
        }
        if self.step_interval_seconds <= 0.0 {
            return Err(Error::msg("step_interval_seconds must be > 0"));
        }
        if self.max_users < self.initial_users {
            return Err(Error::msg("max_users must be >= initial_users"));
        }
        if self.scenario == StressScenario::SpikeStress
            && (self.spike_users == 0 || self.spike_hold_seconds <= 0.0)
        {
            return Err(Error::msg(
                "spike_stress scenario requires spike_users > 0 and spike_hold_seconds > 0",
            ));
        }
        if self.scenario == StressScenario::SoakStress
            && (self.soak_users == 0 || self.soak_duration_seconds <= 0.0)
        {
            return Err(Error::msg(
                "soak_stress scenario requires soak_users > 0 and soak_duration_seconds > 0",
            ));
        }
        Ok(())
    }
}

pub fn load_scenario_config(path: &Path) -> Result<ScenarioConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file: {}", path.display()))?;
    let config: ScenarioConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("invalid YAML in config file: {}", path.display()))?;
    config.validate()?;
    tracing::debug!(
        users = config.users,
        duration = config.duration_seconds,
        scenario = %config.scenario,
        "已加载负载配置"
    );
    Ok(config)
}

pub fn load_stress_config(path: &Path) -> Result<StressConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read stress config file: {}", path.display()))?;
    let config: StressConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("invalid YAML in stress config file: {}", path.display()))?;
    config.validate()?;
    tracing::debug!(
        scenario = %config.scenario,
        initial_users = config.initial_users,
        max_users = config.max_users,
        "已加载压力配置"
    );
    Ok(config)
}
