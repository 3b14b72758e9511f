use std::time::Duration;

/// Tunables of the messaging engine
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Longest edge of an uploaded image after downscaling (default: 1024)
    pub max_image_dimension: u32,

    /// JPEG quality used when re-encoding attachments, 1-100 (default: 65)
    pub jpeg_quality: u8,

    /// Hard cap on the encoded attachment size (default: 10 MiB)
    pub max_upload_bytes: usize,

    /// Timeout applied to every upload attempt (default: 45s)
    pub upload_timeout: Duration,

    /// Extra upload attempts after the first one fails (default: 1)
    pub upload_retries: u32,

    /// Images accepted by a single multi-image send (default: 5)
    pub max_images_per_send: usize,

    /// Conversation preview length before it is truncated (default: 100)
    pub preview_max_chars: usize,

    /// Inactivity after which the typing flag reverts to false (default: 2s)
    pub typing_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_image_dimension: 1024,
            jpeg_quality: 65,
            max_upload_bytes: 10 * 1024 * 1024,
            upload_timeout: Duration::from_secs(45),
            upload_retries: 1,
            max_images_per_send: 5,
            preview_max_chars: 100,
            typing_timeout: Duration::from_secs(2),
        }
    }
}
