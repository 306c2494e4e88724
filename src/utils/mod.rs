// src/utils/mod.rs
use log::{info, LevelFilter};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Installs the process-wide logger. Library code only emits records; the
/// binary calls this once at startup.
pub fn setup_logging(level: LevelFilter) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("hyper", LevelFilter::Warn)
        .level_for("mio", LevelFilter::Warn)
        .chain(std::io::stdout())
        .apply()?;
    info!("Logging initialized at {}.", level);
    Ok(())
}

/// Exact identity of a logical request: canonical JSON of `[type, params]`.
///
/// `serde_json` objects serialize with sorted keys, so parameter order never
/// changes the identity.
pub fn canonical_request(request_type: &str, params: &Value) -> String {
    serde_json::json!([request_type, params]).to_string()
}

/// Short hex digest of `canonical_request`, for log lines.
pub fn request_fingerprint(request_type: &str, params: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    canonical_request(request_type, params).hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
