use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error(transparent)]
    Provider(#[from] crate::provider::ProviderError),
}
