use std::sync::Mutex;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd)]
pub enum LogLevel {
    Silent = 0,
    Normal = 1,
    Verbose = 2,
}

impl LogLevel {
    pub fn parse(value: &str) -> Option<LogLevel> {
        match value.to_ascii_lowercase().as_str() {
            "silent" => Some(LogLevel::Silent),
            "normal" => Some(LogLevel::Normal),
            "verbose" => Some(LogLevel::Verbose),
            _ => None,
        }
    }
}

struct LoggerState {
    level: LogLevel,
    buffering: bool,
    buffer: Vec<String>,
}

lazy_static::lazy_static! {
    static ref LOGGER: Mutex<LoggerState> = Mutex::new(LoggerState {
        level: LogLevel::Silent,
        buffering: false,
        buffer: Vec::new(),
    });
}

pub fn set_level(level: LogLevel) {
    if let Ok(mut state) = LOGGER.lock() {
        state.level = level;
    }
}

pub fn level() -> LogLevel {
    LOGGER
        .lock()
        .map(|state| state.level)
        .unwrap_or(LogLevel::Silent)
}

/// While buffering, lines are held in memory so a child process that owns
/// the terminal cannot interleave with our output. Turning buffering off
/// drains the buffer.
pub fn set_buffered(buffering: bool) {
    let drained = {
        let mut state = match LOGGER.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        state.buffering = buffering;
        if buffering {
            Vec::new()
        } else {
            std::mem::take(&mut state.buffer)
        }
    };
    for line in drained {
        println!("{}", line);
    }
}

pub fn flush() {
    let drained = {
        let mut state = match LOGGER.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        std::mem::take(&mut state.buffer)
    };
    for line in drained {
        println!("{}", line);
    }
}

/// Emit a line regardless of the configured level (final verdicts, block
/// lists). Still honors buffering.
pub fn always(line: String) {
    write_line(line);
}

pub fn write_line(line: String) {
    let buffered = {
        let mut state = match LOGGER.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.buffering {
            state.buffer.push(line.clone());
            true
        } else {
            false
        }
    };
    if !buffered {
        println!("{}", line);
    }
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        if $level <= crate::logging::level() {
            crate::logging::write_line(format!($($arg)*));
        }
    };
}
