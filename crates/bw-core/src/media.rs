//! Media format policy and the WAV conversion seam.
//!
//! Broadcastable audio is 16-bit PCM WAV.  Everything else in the
//! supported-extensions set is converted through `ffmpeg`; unsupported
//! extensions are rejected before any subprocess is spawned.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// Source formats the converter accepts besides WAV.
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["mp3", "ogg", "flac", "m4a", "aac", "opus", "wma", "aiff"];

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("unsupported file type: .{0}")]
    UnsupportedExtension(String),
    #[error("converter could not be spawned: {0}")]
    Spawn(String),
    #[error("converter timed out after {0:?}")]
    Timeout(Duration),
    #[error("converter exited with {code}: {stderr}")]
    Failed { code: i32, stderr: String },
}

/// Lowercased extension of `path`, without the dot.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

/// Whether `path` can be broadcast directly or after conversion.
pub fn is_supported_source(path: &Path) -> bool {
    let ext = extension_of(path);
    ext == "wav" || SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Convert `src` to a 16-bit PCM WAV at `dst` via ffmpeg.
///
/// The extension gate runs first so unsupported inputs fail without
/// touching the subprocess.  The generic 30 s subprocess timeout applies.
pub async fn convert_to_wav(src: &Path, dst: &Path) -> Result<(), ConvertError> {
    let ext = extension_of(src);
    if ext != "wav" && !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ConvertError::UnsupportedExtension(ext));
    }

    debug!(src = %src.display(), dst = %dst.display(), "converting to wav");

    let child = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(src)
        .args(["-ar", "44100", "-ac", "2", "-sample_fmt", "s16"])
        .arg(dst)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ConvertError::Spawn(e.to_string()))?;

    let output = match tokio::time::timeout(SUBPROCESS_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ConvertError::Spawn(e.to_string()))?,
        Err(_) => return Err(ConvertError::Timeout(SUBPROCESS_TIMEOUT)),
    };

    if !output.status.success() {
        return Err(ConvertError::Failed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_and_supported_extensions_pass_the_gate() {
        assert!(is_supported_source(Path::new("a.wav")));
        assert!(is_supported_source(Path::new("A.MP3")));
        assert!(is_supported_source(Path::new("x.flac")));
        assert!(!is_supported_source(Path::new("x.mkv")));
        assert!(!is_supported_source(Path::new("noext")));
    }

    #[tokio::test]
    async fn unsupported_extension_is_rejected_without_spawning() {
        let err = convert_to_wav(Path::new("movie.mkv"), Path::new("/tmp/out.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedExtension(e) if e == "mkv"));
    }
}
