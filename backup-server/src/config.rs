use backup_engine::EngineConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the engine configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".into()));
        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("backups.db"));

        let mut engine = match std::env::var("ENGINE_CONFIG") {
            Ok(path) => EngineConfig::from_file(&PathBuf::from(path))?,
            Err(_) => EngineConfig::default(),
        };
        if let Some(secs) = std::env::var("STALE_AFTER_SECS").ok().and_then(|v| v.parse().ok()) {
            engine.stale_after_secs = secs;
        }

        Ok(Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            data_dir,
            db_path,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            engine,
        })
    }

    /// Command-line flags win over the environment.
    pub fn with_args(mut self, args: &Args) -> anyhow::Result<Self> {
        if let Some(path) = &args.config {
            let stale_after_secs = self.engine.stale_after_secs;
            self.engine = EngineConfig::from_file(path)?;
            if std::env::var("STALE_AFTER_SECS").is_ok() {
                self.engine.stale_after_secs = stale_after_secs;
            }
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
        Ok(self)
    }
}
