// bw-core: Shared filesystem-safety and media primitives for the BotWave
// controller and agent.

pub mod media;
pub mod paths;

pub use media::{convert_to_wav, is_supported_source, ConvertError, SUPPORTED_EXTENSIONS};
pub use paths::{safe_join, sanitize_filename, PathError};
