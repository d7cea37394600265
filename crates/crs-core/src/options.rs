//! Argument parsing for the subsystem.
//!
//! Arguments arrive as a comma-separated string from a runtime flag and from
//! the `CRS_ARGUMENTS` environment variable. The environment is untrusted:
//! enabling the subsystem from there additionally requires the
//! `UnlockExperimentalCRS` token. Unrecognized options are ignored.

use tracing::level_filters::LevelFilter;

const ARGS_ENV_VAR_NAME: &str = "CRS_ARGUMENTS";
const USE_CRS_ARGUMENT: &str = "useCRS";
const UNLOCK_CRS_ARGUMENT: &str = "UnlockExperimentalCRS";
const USE_CRS_FORCE: &str = "force";
const USE_CRS_AUTO: &str = "auto";

/// Default buffer-area size when the host supplies none.
pub const DEFAULT_AREA_SIZE: usize = 8 * 1024 * 1024;

/// Logging verbosity of the subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, including per-record noise.
    Trace,
    /// Lifecycle and flush details.
    Debug,
    /// Notable state changes.
    Info,
    /// Degraded but operating.
    Warning,
    /// Subsystem-disabling failures only.
    Error,
    /// Nothing.
    Off,
}

impl LogLevel {
    fn parse(value: &str) -> Option<LogLevel> {
        match value {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "off" => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// The equivalent `tracing` filter, for the host's subscriber.
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

/// Parsed subsystem options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Whether the subsystem is enabled.
    pub use_crs: bool,
    /// Buffer-area size in bytes.
    pub area_size: usize,
    /// The raw argument string handed to the agent's start method.
    pub arguments: String,
    log_level: Option<LogLevel>,
    vm_log_level: Option<LogLevel>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            use_crs: false,
            area_size: DEFAULT_AREA_SIZE,
            arguments: String::new(),
            log_level: None,
            vm_log_level: None,
        }
    }
}

impl Options {
    /// Parses options from the environment, then from the runtime flag
    /// (which wins where both set a value and needs no unlock token).
    pub fn from_env_and_flag(flag: Option<&str>) -> Options {
        let mut options = Options::default();
        if let Ok(env_args) = std::env::var(ARGS_ENV_VAR_NAME) {
            options.parse_arguments(&env_args, true);
        }
        if let Some(flag) = flag {
            options.parse_arguments(flag, false);
            options.arguments = flag.to_string();
        }
        options
    }

    /// Parses one comma-separated argument string. `needs_unlock` requires
    /// the `UnlockExperimentalCRS` token for `useCRS` to take effect, as for
    /// arguments read from the environment.
    pub fn parse_arguments(&mut self, arguments: &str, needs_unlock: bool) {
        let mut use_crs = false;
        let mut unlock_is_set = false;

        for part in arguments.split(',') {
            match part.split_once('=') {
                Some(("log", value)) => {
                    if let Some(level) = LogLevel::parse(value) {
                        self.log_level = Some(level);
                    }
                }
                Some(("log+vm", value)) => {
                    if let Some(level) = LogLevel::parse(value) {
                        self.vm_log_level = Some(level);
                    }
                }
                Some((USE_CRS_ARGUMENT, value)) => {
                    if value == USE_CRS_AUTO || value == USE_CRS_FORCE {
                        use_crs = true;
                    }
                }
                Some(_) => {}
                None if part == USE_CRS_ARGUMENT => use_crs = true,
                None if part == UNLOCK_CRS_ARGUMENT => unlock_is_set = true,
                None => {}
            }
        }

        if use_crs && (!needs_unlock || unlock_is_set) {
            self.use_crs = true;
        }
    }

    /// Effective subsystem log level: the `log+vm` scope wins over `log`,
    /// and the default is errors only.
    pub fn log_level(&self) -> LogLevel {
        self.vm_log_level
            .or(self.log_level)
            .unwrap_or(LogLevel::Error)
    }
}
