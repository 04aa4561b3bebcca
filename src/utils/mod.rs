use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Ensure directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path).with_context(|| format!("Failed to create directory: {:?}", path))?;
    }
    Ok(())
}

/// Read an optional JSON settings file, falling back to `default`
pub fn read_settings<T: DeserializeOwned, P: AsRef<Path>>(path: Option<P>, default: T) -> Result<T> {
    match path {
        None => Ok(default),
        Some(path) => {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("Invalid settings in {:?}", path))
        }
    }
}

/// Name of the `repeat`-th run (1-based) of `model`
pub fn run_name(model: &str, repeat: usize) -> String {
    format!("{}_{}", model, repeat)
}

/// Format duration as human-readable string
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::StagingConfig;
    use tempfile::TempDir;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30.0s");
        assert_eq!(format_duration(90.0), "1.5m");
        assert_eq!(format_duration(3600.0), "1.0h");
    }

    #[test]
    fn test_run_name() {
        assert_eq!(run_name("attention_bi_lstm", 3), "attention_bi_lstm_3");
    }

    #[test]
    fn test_read_settings() {
        let dir = TempDir::new().unwrap();
        let default = StagingConfig::default();
        assert_eq!(read_settings::<_, &Path>(None, default).unwrap(), default);

        let path = dir.path().join("staging.json");
        let custom = StagingConfig {
            classes: 4,
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&custom).unwrap()).unwrap();
        assert_eq!(read_settings(Some(&path), default).unwrap(), custom);

        std::fs::write(&path, "{").unwrap();
        assert!(read_settings(Some(&path), default).is_err());
    }

    #[test]
    fn test_ensure_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
