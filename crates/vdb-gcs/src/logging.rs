//! Process-wide log output.
//!
//! The library logs through `tracing` and never installs a subscriber on
//! its own. Applications that do not bring their own can call [`init`] with
//! a [`LogConfig`] to send output to stderr, a file or a callback.

use std::fs::{File, OpenOptions};
use std::io;
use std::sync::Arc;

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogCallback, LogConfig, LogSink};
use crate::error::{GcsError, GcsResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.debug`. Fails if the log file
/// cannot be opened or a global subscriber is already installed.
pub fn init(config: &LogConfig) -> GcsResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.debug { "debug" } else { "info" })
    });

    tracing_subscriber::registry()
        .with(output_layer(config)?)
        .with(filter)
        .try_init()
        .map_err(|e| GcsError::Logging(e.to_string()))?;

    tracing::debug!(sink = ?config.sink, debug = config.debug, "logging initialized");
    Ok(())
}

fn output_layer(config: &LogConfig) -> GcsResult<BoxedLayer> {
    let layer = match &config.sink {
        LogSink::Stderr => {
            let layer = fmt::layer().with_writer(std::io::stderr);
            if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        LogSink::File(path) => {
            let file = open_log_file(path)?;
            let layer = fmt::layer().with_ansi(false).with_writer(file);
            if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        LogSink::Callback(callback) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(CallbackWriter(callback.clone()));
            if config.timestamps {
                layer.boxed()
            } else {
                layer.without_time().boxed()
            }
        }
    };
    Ok(layer)
}

/// Makes one [`LineBuffer`] per event.
struct CallbackWriter(LogCallback);

impl<'a> MakeWriter<'a> for CallbackWriter {
    type Writer = LineBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        LineBuffer::new(self.0.clone(), Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        LineBuffer::new(self.0.clone(), *meta.level())
    }
}

/// Collects one formatted event and hands it to the callback on drop.
struct LineBuffer {
    callback: LogCallback,
    level: Level,
    buf: Vec<u8>,
}

impl LineBuffer {
    fn new(callback: LogCallback, level: Level) -> Self {
        Self {
            callback,
            level,
            buf: Vec::new(),
        }
    }
}

impl io::Write for LineBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineBuffer {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf);
        self.callback.call(self.level, line.trim_end());
    }
}

fn open_log_file(path: &std::path::Path) -> GcsResult<Arc<File>> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Arc::new)
        .map_err(|e| GcsError::Logging(format!("failed to open {}: {e}", path.display())))
}
