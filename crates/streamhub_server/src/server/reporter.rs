#![forbid(unsafe_code)]

use std::any::Any;

use tracing::warn;

/// Sink for failures that are isolated at their call site (subscriber, persistence, connect).
pub trait ErrorReporter: Send + Sync + 'static {
	fn report(&self, context: &str, error: &anyhow::Error);
}

/// Reports through `tracing` and the metrics facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
	fn report(&self, context: &str, error: &anyhow::Error) {
		metrics::counter!("streamhub_errors_reported_total", "context" => context.to_string()).increment(1);
		warn!(context, error = %format!("{error:#}"), "isolated failure");
	}
}

/// Render a caught panic payload as an error.
pub fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
	let msg = if let Some(s) = payload.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"non-string panic payload".to_string()
	};
	anyhow::anyhow!("panicked: {msg}")
}

#[cfg(test)]
pub(crate) mod testing {
	use parking_lot::Mutex;

	use super::ErrorReporter;

	/// Keeps every report for later assertions.
	#[derive(Debug, Default)]
	pub struct RecordingReporter {
		reports: Mutex<Vec<(String, String)>>,
	}

	impl RecordingReporter {
		pub fn reports(&self) -> Vec<(String, String)> {
			self.reports.lock().clone()
		}

		pub fn contexts(&self) -> Vec<String> {
			self.reports.lock().iter().map(|(c, _)| c.clone()).collect()
		}
	}

	impl ErrorReporter for RecordingReporter {
		fn report(&self, context: &str, error: &anyhow::Error) {
			self.reports.lock().push((context.to_string(), format!("{error:#}")));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn panic_payloads_become_messages() {
		let err = std::panic::catch_unwind(|| panic!("boom")).map_err(panic_error).unwrap_err();
		assert_eq!(err.to_string(), "panicked: boom");

		let err = std::panic::catch_unwind(|| panic!("code {}", 7)).map_err(panic_error).unwrap_err();
		assert_eq!(err.to_string(), "panicked: code 7");
	}
}
