//! Various utility and helper functions: logging, data directory and config parsing.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Once,
};

use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {h({l})} {T} - {m}{n}";

static LOGGER: Once = Once::new();

/// Get the default data directory. `~/.handshake`
pub fn get_handshake_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".handshake")
}

/// Setup the logger, printing to the console and to `debug.log` in the data directory.
///
/// Only the first call has an effect.
pub fn setup_logger(level: LevelFilter, data_dir: Option<PathBuf>) {
    LOGGER.call_once(|| {
        let data_dir = data_dir.unwrap_or_else(get_handshake_dir);
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();

        let mut builder =
            Config::builder().appender(Appender::builder().build("stdout", Box::new(console)));
        let mut root = Root::builder().appender("stdout");

        match FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(data_dir.join("debug.log"))
        {
            Ok(file) => {
                builder = builder.appender(Appender::builder().build("file", Box::new(file)));
                root = root.appender("file");
            }
            Err(e) => eprintln!("Logging to console only, cannot open debug.log: {}", e),
        }

        match builder.build(root.build(level)) {
            Ok(config) => {
                if let Err(e) = log4rs::init_config(config) {
                    eprintln!("Failed initializing logger: {}", e);
                }
            }
            Err(e) => eprintln!("Invalid logger config: {}", e),
        }
    });
}

/// Parse a flat `key = value` toml file. Section headers and comments are skipped.
pub fn parse_toml(file_path: &Path) -> io::Result<HashMap<String, String>> {
    let reader = BufReader::new(File::open(file_path)?);
    let mut map = HashMap::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    Ok(map)
}

/// Parse a config value, falling back to `default` if it's missing or malformed.
pub fn parse_field<T: FromStr>(value: Option<&String>, default: T) -> T {
    value
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}
