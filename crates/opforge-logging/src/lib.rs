//! Logging bootstrap shared by opforge binaries and tests.
//!
//! The libraries log through the `log` facade. [`init_logging`] bridges those records
//! into a `tracing` registry filtered by `OPFORGE_LOG` (or `RUST_LOG`), prints them to
//! stderr and forwards each one to an optional process-wide hook.

use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use tracing::subscriber::DefaultGuard;
use tracing::Subscriber;
use tracing_log::{LogTracer, NormalizeEvent};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

pub const ENV_LOG: &str = "OPFORGE_LOG";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: String,
    pub target: String,
    pub message: String,
}

type LogHook = Arc<dyn Fn(&LogRecord) + Send + Sync>;

static LOG_HOOK: OnceCell<LogHook> = OnceCell::new();

/// Keeps a thread-local subscriber alive when a global one was already installed.
pub struct LoggingGuard {
    _guard: Option<DefaultGuard>,
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Print formatted records to stderr.
    pub stderr: bool,
    pub ansi: bool,
    /// Directive used when neither `OPFORGE_LOG` nor `RUST_LOG` is set.
    pub default_filter: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            stderr: true,
            ansi: true,
            default_filter: "info".to_string(),
        }
    }
}

/// Register a callback receiving every record that passes the filter. Only the
/// first registration takes effect.
pub fn set_log_hook<F>(hook: F)
where
    F: Fn(&LogRecord) + Send + Sync + 'static,
{
    let _ = LOG_HOOK.set(Arc::new(hook));
}

pub fn init_logging(opts: LoggingOptions) -> LoggingGuard {
    // Route log:: macros into tracing.
    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(&opts.default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let build_subscriber = || {
        let fmt_layer = opts.stderr.then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(opts.ansi)
                .with_target(true)
        });
        tracing_subscriber::registry()
            .with(env_filter.clone())
            .with(fmt_layer)
            .with(HookLayer)
    };

    let guard = match tracing::subscriber::set_global_default(build_subscriber()) {
        Ok(()) => None,
        Err(_) => Some(tracing::subscriber::set_default(build_subscriber())),
    };
    LoggingGuard { _guard: guard }
}

struct HookLayer;

impl<S> Layer<S> for HookLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let Some(hook) = LOG_HOOK.get() else {
            return;
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());
        let record = LogRecord {
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.message.unwrap_or_else(|| meta.name().to_string()),
        };
        hook(&record);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn log_and_tracing_records_reach_the_hook() {
        let captured: Arc<Mutex<Vec<LogRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let hook = {
            let c = captured.clone();
            move |rec: &LogRecord| {
                c.lock().unwrap().push(rec.clone());
            }
        };
        set_log_hook(hook);
        let _guard = init_logging(LoggingOptions {
            stderr: false,
            ..LoggingOptions::default()
        });
        let _again = init_logging(LoggingOptions {
            stderr: false,
            ..LoggingOptions::default()
        });

        tracing::info!("hello from tracing");
        log::warn!(target: "opforge::cache", "hello from log");

        let items = captured.lock().unwrap();
        assert!(items.iter().any(|r| r.message.contains("hello from tracing")));
        assert!(items
            .iter()
            .any(|r| r.message.contains("hello from log") && r.target == "opforge::cache"));
    }
}
