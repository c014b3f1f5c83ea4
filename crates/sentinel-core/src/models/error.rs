use thiserror::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    InvalidInput,
    NotFound,
    Timeout,
    Cancelled,
    CircuitOpen,
    ResourceExhausted,
    ShuttingDown,
    OperationFailed,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{kind:?}: {message}")]
pub struct CoreError {
    pub plugin: Option<String>,
    pub operation: Option<String>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            plugin: None,
            operation: None,
            kind,
            message: message.into(),
        }
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Fills in plugin and operation context without overwriting what the
    /// error already carries.
    pub fn attribute(self, plugin: Option<&str>, operation: Option<&str>) -> Self {
        Self {
            plugin: self.plugin.or_else(|| plugin.map(str::to_string)),
            operation: self.operation.or_else(|| operation.map(str::to_string)),
            kind: self.kind,
            message: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreError, CoreErrorKind};

    #[test]
    fn display_includes_kind_and_message() {
        let error = CoreError::new(CoreErrorKind::Timeout, "job 'x' timed out");
        assert_eq!(error.to_string(), "Timeout: job 'x' timed out");
    }

    #[test]
    fn attribution_keeps_existing_context() {
        let error = CoreError::new(CoreErrorKind::OperationFailed, "boom")
            .with_plugin("grants-gov")
            .attribute(Some("other"), Some("discover"));

        assert_eq!(error.plugin.as_deref(), Some("grants-gov"));
        assert_eq!(error.operation.as_deref(), Some("discover"));
    }
}
