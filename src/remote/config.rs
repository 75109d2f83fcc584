//! Configuration resolution for the remote core.
//!
//! Each tunable resolves with a three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WINADMIN_CONNECT_TIMEOUT` | 10s | Connect + auth + probe bound in seconds |
//! | `WINADMIN_OPERATION_TIMEOUT` | 60s | Per-host operation bound in seconds |
//! | `WINADMIN_MAX_RETRIES` | 2 | Connect retries for transient failures |
//! | `WINADMIN_RETRY_DELAY_MS` | 500ms | Initial retry delay in milliseconds |
//! | `WINADMIN_COMPRESSION` | true | Enable zlib compression |
//! | `WINADMIN_POOL_SIZE` | 4 | Fan-out worker bound |
//! | `WINADMIN_CHUNK_SIZE` | 65536 | Transfer chunk size in bytes |
//! | `WINADMIN_CHUNK_RETRIES` | 3 | Retries for a transient chunk failure |
//! | `WINADMIN_LIVENESS_IDLE` | 30s | Idle time before liveness is confirmed by probe |
//! | `WINADMIN_STORE_PATH` | config dir | Connection store file |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default connect timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default per-host operation timeout in seconds
pub(crate) const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 60;

/// Default maximum connect retries
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Default fan-out worker bound
pub(crate) const DEFAULT_POOL_SIZE: usize = 4;

/// Upper bound on the fan-out worker pool
pub(crate) const MAX_POOL_SIZE: usize = 32;

/// Default transfer chunk size (64 KiB)
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) const MIN_CHUNK_SIZE: usize = 4 * 1024;
pub(crate) const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Default retries for a transient chunk failure
pub(crate) const DEFAULT_CHUNK_RETRIES: u32 = 3;

/// Default idle time before `is_alive` is confirmed with a probe
pub(crate) const DEFAULT_LIVENESS_IDLE_SECS: u64 = 30;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "WINADMIN_CONNECT_TIMEOUT";
pub(crate) const OPERATION_TIMEOUT_ENV_VAR: &str = "WINADMIN_OPERATION_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "WINADMIN_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "WINADMIN_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "WINADMIN_COMPRESSION";
pub(crate) const POOL_SIZE_ENV_VAR: &str = "WINADMIN_POOL_SIZE";
pub(crate) const CHUNK_SIZE_ENV_VAR: &str = "WINADMIN_CHUNK_SIZE";
pub(crate) const CHUNK_RETRIES_ENV_VAR: &str = "WINADMIN_CHUNK_RETRIES";
pub(crate) const LIVENESS_IDLE_ENV_VAR: &str = "WINADMIN_LIVENESS_IDLE";
pub(crate) const STORE_PATH_ENV_VAR: &str = "WINADMIN_STORE_PATH";

/// Parse an environment variable, ignoring it when unset or malformed.
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Resolve the connect timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(CONNECT_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the per-host operation timeout with priority: parameter -> env var -> default
pub(crate) fn resolve_operation_timeout(timeout_param: Option<u64>) -> Duration {
    let secs = timeout_param
        .or_else(|| env_parse(OPERATION_TIMEOUT_ENV_VAR))
        .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Resolve the max connect retries with priority: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    max_retries_param
        .or_else(|| env_parse(MAX_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_MAX_RETRIES)
}

/// Resolve the retry delay with priority: parameter -> env var -> default
pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    let ms = retry_delay_param
        .or_else(|| env_parse(RETRY_DELAY_MS_ENV_VAR))
        .unwrap_or(DEFAULT_RETRY_DELAY_MS);
    Duration::from_millis(ms)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Resolve the fan-out pool size, clamped to `1..=MAX_POOL_SIZE`.
pub(crate) fn resolve_pool_size(pool_param: Option<usize>) -> usize {
    pool_param
        .or_else(|| env_parse(POOL_SIZE_ENV_VAR))
        .unwrap_or(DEFAULT_POOL_SIZE)
        .clamp(1, MAX_POOL_SIZE)
}

/// Resolve the transfer chunk size, clamped to `MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE`.
pub(crate) fn resolve_chunk_size(chunk_param: Option<usize>) -> usize {
    chunk_param
        .or_else(|| env_parse(CHUNK_SIZE_ENV_VAR))
        .unwrap_or(DEFAULT_CHUNK_SIZE)
        .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

pub(crate) fn resolve_chunk_retries(retries_param: Option<u32>) -> u32 {
    retries_param
        .or_else(|| env_parse(CHUNK_RETRIES_ENV_VAR))
        .unwrap_or(DEFAULT_CHUNK_RETRIES)
}

pub(crate) fn resolve_liveness_idle(idle_param: Option<u64>) -> Duration {
    let secs = idle_param
        .or_else(|| env_parse(LIVENESS_IDLE_ENV_VAR))
        .unwrap_or(DEFAULT_LIVENESS_IDLE_SECS);
    Duration::from_secs(secs)
}

/// Resolve the connection store path: parameter -> env var -> platform config dir.
///
/// Returns `None` only when no config directory can be determined.
pub(crate) fn resolve_store_path(path_param: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path_param {
        return Some(path);
    }

    if let Ok(env_path) = env::var(STORE_PATH_ENV_VAR)
        && !env_path.trim().is_empty()
    {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|dir| dir.join("WinAdmin").join("connections.json"))
}

/// Resolved settings shared by the manager, fan-out executor and transfer controller.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compression: bool,
    pub pool_size: usize,
    pub chunk_size: usize,
    pub chunk_retries: u32,
    pub liveness_idle: Duration,
    pub store_path: Option<PathBuf>,
}

impl RemoteConfig {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: resolve_connect_timeout(None),
            operation_timeout: resolve_operation_timeout(None),
            max_retries: resolve_max_retries(None),
            retry_delay: resolve_retry_delay(None),
            compression: resolve_compression(None),
            pool_size: resolve_pool_size(None),
            chunk_size: resolve_chunk_size(None),
            chunk_retries: resolve_chunk_retries(None),
            liveness_idle: resolve_liveness_idle(None),
            store_path: resolve_store_path(None),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compression: true,
            pool_size: DEFAULT_POOL_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            liveness_idle: Duration::from_secs(DEFAULT_LIVENESS_IDLE_SECS),
            store_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Serialize env var tests to avoid races between parallel tests
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod connect_timeout {
        use super::*;

        #[test]
        fn test_uses_param_when_provided() {
            assert_eq!(resolve_connect_timeout(Some(25)), Duration::from_secs(25));
        }

        #[test]
        fn test_param_takes_priority_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(CONNECT_TIMEOUT_ENV_VAR, "120") };
            let result = resolve_connect_timeout(Some(5));
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(CONNECT_TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(5));
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(CONNECT_TIMEOUT_ENV_VAR, "42") };
            let result = resolve_connect_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(CONNECT_TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(42));
        }

        #[test]
        fn test_ignores_invalid_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(CONNECT_TIMEOUT_ENV_VAR, "-10") };
            let result = resolve_connect_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(CONNECT_TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
        }
    }

    mod operation_timeout {
        use super::*;

        #[test]
        fn test_uses_default_when_no_param_or_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(OPERATION_TIMEOUT_ENV_VAR) };
            assert_eq!(
                resolve_operation_timeout(None),
                Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS)
            );
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(OPERATION_TIMEOUT_ENV_VAR, "240") };
            let result = resolve_operation_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(OPERATION_TIMEOUT_ENV_VAR) };
            assert_eq!(result, Duration::from_secs(240));
        }
    }

    mod pool_size {
        use super::*;

        #[test]
        fn test_zero_is_clamped_to_one() {
            assert_eq!(resolve_pool_size(Some(0)), 1);
        }

        #[test]
        fn test_huge_value_is_clamped() {
            assert_eq!(resolve_pool_size(Some(1000)), MAX_POOL_SIZE);
        }

        #[test]
        fn test_env_var_is_used() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(POOL_SIZE_ENV_VAR, "8") };
            let result = resolve_pool_size(None);
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(POOL_SIZE_ENV_VAR) };
            assert_eq!(result, 8);
        }
    }

    mod chunk_size {
        use super::*;

        #[test]
        fn test_default() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(CHUNK_SIZE_ENV_VAR) };
            assert_eq!(resolve_chunk_size(None), DEFAULT_CHUNK_SIZE);
        }

        #[test]
        fn test_clamped_to_bounds() {
            assert_eq!(resolve_chunk_size(Some(1)), MIN_CHUNK_SIZE);
            assert_eq!(resolve_chunk_size(Some(usize::MAX)), MAX_CHUNK_SIZE);
        }
    }

    mod compression {
        use super::*;

        #[test]
        fn test_param_wins() {
            assert!(!resolve_compression(Some(false)));
        }

        #[test]
        fn test_env_values() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(COMPRESSION_ENV_VAR, "0") };
            let off = resolve_compression(None);
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(COMPRESSION_ENV_VAR, "TRUE") };
            let on = resolve_compression(None);
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(COMPRESSION_ENV_VAR) };
            assert!(!off);
            assert!(on);
        }
    }

    mod store_path {
        use super::*;

        #[test]
        fn test_param_wins() {
            let path = PathBuf::from("/tmp/custom.json");
            assert_eq!(resolve_store_path(Some(path.clone())), Some(path));
        }

        #[test]
        fn test_env_var_is_used() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { set_env(STORE_PATH_ENV_VAR, "/srv/winadmin/hosts.json") };
            let result = resolve_store_path(None);
            // SAFETY: Holding ENV_TEST_MUTEX
            unsafe { remove_env(STORE_PATH_ENV_VAR) };
            assert_eq!(result, Some(PathBuf::from("/srv/winadmin/hosts.json")));
        }
    }

    #[test]
    fn test_default_config_matches_constants() {
        let config = RemoteConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert!(config.store_path.is_none());
    }

    #[test]
    fn test_max_retry_delay_is_reasonable() {
        assert!(MAX_RETRY_DELAY.as_secs() >= 5);
        assert!(MAX_RETRY_DELAY.as_secs() <= 60);
    }
}
