use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "DELI_LOG_LEVEL";
// text | json
pub const LOG_FORMAT_ENV: &str = "DELI_LOG_FORMAT";

// 日志走stderr，stdout留给实时输出和汇总行。
// 重复初始化时静默忽略，测试里会多次调用。
pub fn init_logging() {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = std::env::var(LOG_FORMAT_ENV)
        .unwrap_or_else(|_| "text".to_string())
        .to_ascii_lowercase();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
