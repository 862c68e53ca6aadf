/* Process-wide library context: log level filter and an optional host log
 * sink. Created once, passed by reference, torn down at program exit. */
use std::fmt;

use crate::error::Result;

/* Severity levels exposed to the host log sink. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Error,
    Warning,
    Info,
    Debug,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::None => "none",
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.write_str(s)
    }
}

pub type LogFunc = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/* Library context. Devices and parsers hold a shared reference and route  */
/* their diagnostics through it; internal `tracing` events fire regardless */
/* so hosts with a subscriber installed need no sink at all.               */
pub struct Context {
    loglevel: LogLevel,
    logfunc: Option<LogFunc>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            loglevel: LogLevel::Warning,
            logfunc: None,
        }
    }

    pub fn set_loglevel(&mut self, level: LogLevel) -> Result<()> {
        self.loglevel = level;
        Ok(())
    }

    pub fn set_logfunc<F>(&mut self, func: F) -> Result<()>
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        self.logfunc = Some(Box::new(func));
        Ok(())
    }

    pub fn loglevel(&self) -> LogLevel {
        self.loglevel
    }

    /* Dispatch one message to the host sink, applying the level filter. */
    pub fn log(&self, level: LogLevel, msg: &str) {
        if level > self.loglevel || level == LogLevel::None {
            return;
        }
        if let Some(func) = &self.logfunc {
            func(level, msg);
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("loglevel", &self.loglevel)
            .field("logfunc", &self.logfunc.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn level_filter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut ctx = Context::new();
        ctx.set_loglevel(LogLevel::Warning).unwrap();
        ctx.set_logfunc(move |level, msg| {
            sink.lock().unwrap().push((level, msg.to_string()));
        })
        .unwrap();

        ctx.log(LogLevel::Error, "kept");
        ctx.log(LogLevel::Warning, "kept too");
        ctx.log(LogLevel::Debug, "filtered");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, "kept");
    }

    #[test]
    fn no_sink_is_silent() {
        let ctx = Context::new();
        ctx.log(LogLevel::Error, "dropped on the floor");
    }
}
