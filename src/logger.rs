//! Process-wide logger setup driven by the `log_file` / `log_level`
//! configuration keys. Call once at startup; the `log` macros are usable
//! everywhere afterwards.

use captains_log::{recipe, Level};

use crate::config::XrpcConfig;
use crate::error::XrpcError;

fn parse_level(name: &str) -> Result<Level, XrpcError> {
    match name {
        "trace" => Ok(Level::Trace),
        "debug" => Ok(Level::Debug),
        "info" => Ok(Level::Info),
        "warn" => Ok(Level::Warn),
        // `log` has no severity above error
        "error" | "critical" => Ok(Level::Error),
        other => Err(XrpcError::Config(format!("unknown log_level {:?}", other))),
    }
}

pub fn init_from_config(cfg: &XrpcConfig) -> Result<(), XrpcError> {
    let level = parse_level(cfg.log_level())?;
    recipe::raw_file_logger(cfg.log_file(), level)
        .build()
        .map_err(|e| XrpcError::Config(format!("fail to init logger: {:?}", e)))?;
    Ok(())
}

/// Test variant: re-initializable, logs to a shared file under /tmp.
pub fn init_test_logger() {
    let _ = recipe::raw_file_logger("/tmp/xrpc_test.log", Level::Trace).test().build();
}
