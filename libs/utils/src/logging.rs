use std::str::FromStr;

use anyhow::Context;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unknown log format: '{s}', expected 'plain' or 'json'"),
        }
    }
}

/// Initialize the process-wide tracing subscriber. Filtering comes from
/// `RUST_LOG` with an `info` default; output goes to stderr so command
/// output on stdout stays machine-readable.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Plain => base.init(),
        LogFormat::Json => base.json().init(),
    }

    Ok(())
}

/// A wrapper that hides its contents from `Debug`/`Display`, for options
/// carrying credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

impl FromStr for SecretString {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SecretString(s.to_string()))
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Parse a secret from a file, for `*-key-file` style options.
pub fn secret_from_file(path: &camino::Utf8Path) -> anyhow::Result<SecretString> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read secret file '{path}'"))?;
    Ok(SecretString(contents.trim_end().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parse() {
        assert_eq!(LogFormat::from_str("plain").unwrap(), LogFormat::Plain);
        assert_eq!(LogFormat::from_str("json").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("yaml").is_err());
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let secret: SecretString = "hunter2".parse().unwrap();
        assert_eq!(format!("{secret:?}"), "[redacted]");
        assert_eq!(secret.expose(), "hunter2");
    }
}
