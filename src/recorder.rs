use parking_lot::Mutex;

/// Collects the lifecycle callbacks the store fires while flushing rows.
///
/// One recorder belongs to one store, so experiments that each build their own
/// store never see each other's messages.
#[derive(Debug, Default)]
pub struct LifecycleRecorder {
    messages: Mutex<Vec<String>>,
}

impl LifecycleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: impl Into<String>) {
        self.messages.lock().push(message.into());
    }

    /// Returns a copy of the messages recorded so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}
