use tracing::metadata::LevelFilter;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::EnvFilter;

const TIME_FORMAT: &str = "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3][offset_hour sign:mandatory]:[offset_minute]";

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("invalid log time format: {0}")]
    TimeFormat(#[from] time::error::InvalidFormatDescription),
    #[error("setting default subscriber failed: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// `default_level`.
pub fn tracing_init(default_level: LevelFilter) -> Result<(), TraceError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let time_format = time::format_description::parse(TIME_FORMAT)?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(LocalTime::new(time_format))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_format_parses() {
        assert!(time::format_description::parse(TIME_FORMAT).is_ok());
    }
}
