//! Console output for pass/fail lines and test logs.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing::debug;

#[derive(Clone)]
enum Target {
    Stderr,
    Writer(Arc<Mutex<Box<dyn Write + Send>>>),
    Capture(Arc<Mutex<Vec<u8>>>),
}

/// Shared, line-oriented output handle.
///
/// Each call to [`write_str`](Output::write_str) is written in one piece so
/// lines from concurrent invocations never interleave.
#[derive(Clone)]
pub struct Output {
    target: Target,
}

impl Output {
    /// Write to the process's standard error.
    pub fn stderr() -> Self {
        Self {
            target: Target::Stderr,
        }
    }

    /// Write to an arbitrary writer.
    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Self {
            target: Target::Writer(Arc::new(Mutex::new(Box::new(w)))),
        }
    }

    /// Collect output in memory; read it back with [`captured`](Self::captured).
    pub fn capture() -> Self {
        Self {
            target: Target::Capture(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Everything written so far, for outputs created with [`capture`](Self::capture).
    pub fn captured(&self) -> Option<String> {
        match &self.target {
            Target::Capture(buf) => {
                let buf = buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                Some(String::from_utf8_lossy(&buf).into_owned())
            }
            _ => None,
        }
    }

    /// Write `s` as-is.
    pub fn write_str(&self, s: &str) {
        let result = match &self.target {
            Target::Stderr => io::stderr().lock().write_all(s.as_bytes()),
            Target::Writer(w) => w
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .write_all(s.as_bytes()),
            Target::Capture(buf) => {
                buf.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .extend_from_slice(s.as_bytes());
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "Failed to write output");
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::stderr()
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self.target {
            Target::Stderr => "stderr",
            Target::Writer(_) => "writer",
            Target::Capture(_) => "capture",
        };
        f.debug_struct("Output").field("target", &target).finish()
    }
}
