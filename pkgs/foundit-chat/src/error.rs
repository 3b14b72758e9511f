//! Error types for engine operations

use foundit_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in engine operations
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Not an image: {0}")]
    UnsupportedMediaType(String),
    #[error("Attachment too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Upload timed out after {0:?}")]
    UploadTimeout(Duration),
    #[error("Could not resolve public URL for {0}")]
    UnresolvableUrl(String),
    #[error("No conversation is open")]
    NotOpen,
    #[error("Change feed disconnected")]
    Disconnected,
    #[error("Background task failed: {0}")]
    Task(String),
}

impl ChatError {
    /// Human-readable text for the one notice shown per failed operation
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Validation(reason) => reason.clone(),
            ChatError::Store(StoreError::Conflict(_)) => {
                "That change conflicts with one made elsewhere. Please try again.".to_string()
            }
            ChatError::Store(_) | ChatError::Disconnected => {
                "Something went wrong talking to the server. Please try again.".to_string()
            }
            ChatError::Image(_) | ChatError::Task(_) => {
                "This image could not be processed.".to_string()
            }
            ChatError::UnsupportedMediaType(_) => "Only images can be attached.".to_string(),
            ChatError::TooLarge { limit, .. } => format!(
                "This image is too large to send (limit {} MB).",
                limit / (1024 * 1024)
            ),
            ChatError::Upload(_) | ChatError::UploadTimeout(_) => {
                "The image could not be uploaded. Please try again.".to_string()
            }
            ChatError::UnresolvableUrl(_) => {
                "The image was uploaded but cannot be shared. Please try again.".to_string()
            }
            ChatError::NotOpen => "Open a conversation first.".to_string(),
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
