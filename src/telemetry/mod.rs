pub mod logging {
    use clap::ValueEnum;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        Warn,
        #[default]
        Info,
        Debug,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
            }
        }
    }

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
    pub enum LogFormat {
        /// Human-readable single-line records.
        #[default]
        Pretty,
        /// One JSON object per line with timestamp, level, target and fields.
        Json,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub format: LogFormat,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    static INIT: OnceLock<()> = OnceLock::new();

    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        inner_init(config)?;
        INIT.set(()).ok();
        Ok(())
    }

    fn inner_init(config: &LogConfig) -> Result<(), InitError> {
        let env_filter = build_env_filter(config.level.to_filter());

        match config.format {
            LogFormat::Pretty => {
                let subscriber = tracing_subscriber::fmt()
                    .with_env_filter(env_filter)
                    .with_level(true)
                    .with_target(config.level >= LogLevel::Debug)
                    .with_writer(std::io::stderr)
                    .finish();
                tracing::subscriber::set_global_default(subscriber)
                    .map_err(|err| InitError::Configure(err.to_string()))?;
            }
            LogFormat::Json => {
                let subscriber = tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(env_filter)
                    .with_level(true)
                    .with_target(true)
                    .with_current_span(false)
                    .with_writer(std::io::stderr)
                    .finish();
                tracing::subscriber::set_global_default(subscriber)
                    .map_err(|err| InitError::Configure(err.to_string()))?;
            }
        }
        Ok(())
    }

    fn build_env_filter(level: LevelFilter) -> EnvFilter {
        if let Ok(filter) = std::env::var("MRMD_MONITOR_LOG_FILTER") {
            return EnvFilter::new(filter);
        }
        EnvFilter::new(default_filter_for(level))
    }

    // Dependency chatter (hyper, tungstenite, ...) stays at warn unless the
    // operator opts in through MRMD_MONITOR_LOG_FILTER.
    const DEP_TARGETS: &[&str] = &[
        "hyper",
        "hyper_util",
        "tokio_tungstenite",
        "tungstenite",
        "reqwest",
        "h2",
        "rustls",
        "mio",
    ];

    fn default_filter_for(level: LevelFilter) -> String {
        let base = match level {
            LevelFilter::DEBUG | LevelFilter::TRACE => "debug",
            LevelFilter::INFO => "info",
            LevelFilter::WARN => "warn",
            LevelFilter::ERROR => "error",
            LevelFilter::OFF => "off",
        };
        let mut filter = base.to_owned();
        if level >= LevelFilter::DEBUG {
            for target in DEP_TARGETS {
                filter.push(',');
                filter.push_str(target);
                filter.push_str("=warn");
            }
        }
        filter
    }

}
