use chrono::Local;
use log::LevelFilter;
use std::io::Write;

/// 初始化日志
///
/// 默认级别由 `level` 指定，`RUST_LOG` 可以覆盖。重复调用不会报错。
pub fn init_logger(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_twice() {
        init_logger(LevelFilter::Debug);
        init_logger(LevelFilter::Info);
        log::info!("logger initialized");
    }
}
