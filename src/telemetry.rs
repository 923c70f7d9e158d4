use std::env;

use anyhow::Result;
use anyhow::bail;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

const DEFAULT_FILTER: &str = "info,botforge=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
  Full,
  Compact,
}

fn parse_format(raw: Option<&str>) -> Result<LogFormat> {
  match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
    None => Ok(LogFormat::Full),
    Some(raw) if raw.eq_ignore_ascii_case("full") => Ok(LogFormat::Full),
    Some(raw) if raw.eq_ignore_ascii_case("compact") => Ok(LogFormat::Compact),
    Some(other) => bail!("LOG_FORMAT must be full or compact, got {other:?}"),
  }
}

/// `RUST_LOG` picks the filter, `LOG_FORMAT` (full | compact) the layout.
pub fn init() -> Result<()> {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
  let format = parse_format(env::var("LOG_FORMAT").ok().as_deref())?;
  let builder = fmt().with_env_filter(env_filter).with_target(true);
  match format {
    LogFormat::Full => builder.init(),
    LogFormat::Compact => builder.compact().init(),
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::LogFormat;
  use super::parse_format;

  #[test]
  fn log_format_defaults_to_full() {
    assert_eq!(parse_format(None).unwrap(), LogFormat::Full);
    assert_eq!(parse_format(Some(" ")).unwrap(), LogFormat::Full);
    assert_eq!(parse_format(Some("Compact")).unwrap(), LogFormat::Compact);
    assert!(parse_format(Some("json")).is_err());
  }
}
