//! Per-collection observables surfaced to the host UI.

use tokio::sync::watch;

/// The last non-retriable failure, with enough context to render a toast.
#[derive(Clone, Debug)]
pub struct ErrorSignal {
	pub operation: Box<str>,
	pub document: Option<Box<str>>,
	pub message: String,
}

#[derive(Debug)]
pub struct CollectionSignals {
	error_tx: watch::Sender<Option<ErrorSignal>>,
}

impl Default for CollectionSignals {
	fn default() -> Self {
		let (error_tx, _) = watch::channel(None);
		Self { error_tx }
	}
}

impl CollectionSignals {
	pub fn report(&self, operation: &str, document: Option<&str>, message: impl Into<String>) {
		let signal = ErrorSignal {
			operation: operation.into(),
			document: document.map(Into::into),
			message: message.into(),
		};
		let _ = self.error_tx.send(Some(signal));
	}

	pub fn clear(&self) {
		let _ = self.error_tx.send(None);
	}

	pub fn subscribe(&self) -> watch::Receiver<Option<ErrorSignal>> {
		self.error_tx.subscribe()
	}

	pub fn last_error(&self) -> Option<ErrorSignal> {
		self.error_tx.borrow().clone()
	}
}

// vim: ts=4
