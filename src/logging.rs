//! 简单的日志后端: 把 `log` 门面的输出打印到标准错误, 带本地时间和启动以来的毫秒数

use chrono::{DateTime, Local};
use lazy_static::*;
use log::{Level, LevelFilter, Log, Metadata, Record};

lazy_static! {
    static ref START: DateTime<Local> = Local::now();
}

struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = Local::now();
        let elapsed = now.signed_duration_since(*START).num_milliseconds();
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        eprintln!(
            "\u{1B}[{}m[{} +{}ms {:>5}] {}\u{1B}[0m",
            color,
            now.format("%H:%M:%S%.3f"),
            elapsed,
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

/// 安装日志后端. level 取 error/warn/info/debug/trace/off, 无法识别时使用 info
pub fn init(level: &str) {
    lazy_static::initialize(&START);
    let filter = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    }
}
