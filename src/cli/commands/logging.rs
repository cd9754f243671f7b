use anyhow::{anyhow, Result};
use clap::{builder::ValueParser, Arg, ArgMatches, Command};

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_FORMAT: &str = "log-format";

/// Output shape of the fmt layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("ACCREDIT_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new(ARG_LOG_FORMAT)
                .long("log-format")
                .help("Log output format")
                .env("ACCREDIT_LOG_FORMAT")
                .default_value("pretty")
                .value_parser(["pretty", "json"]),
        )
}

/// Read `--log-format` from parsed matches.
///
/// # Errors
/// Returns an error if the value is not one of the accepted formats.
pub fn log_format(matches: &ArgMatches) -> Result<LogFormat> {
    match matches
        .get_one::<String>(ARG_LOG_FORMAT)
        .map_or("pretty", String::as_str)
    {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => Err(anyhow!("unsupported log format: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_accepts_names_and_numbers() {
        let parser = validator_log_level();
        let command = Command::new("test").arg(Arg::new("level").value_parser(parser));
        for (input, expected) in [("debug", 3u8), ("WARN", 1), ("4", 4)] {
            let matches = command.clone().get_matches_from(vec!["test", input]);
            assert_eq!(matches.get_one::<u8>("level").copied(), Some(expected));
        }
        assert!(command
            .clone()
            .try_get_matches_from(vec!["test", "loud"])
            .is_err());
        assert!(command.try_get_matches_from(vec!["test", "6"]).is_err());
    }

    #[test]
    fn log_format_from_env() {
        temp_env::with_vars([("ACCREDIT_LOG_FORMAT", Some("json"))], || {
            let matches = with_args(Command::new("test")).get_matches_from(vec!["test"]);
            assert!(matches!(log_format(&matches), Ok(LogFormat::Json)));
        });
        temp_env::with_vars([("ACCREDIT_LOG_FORMAT", None::<&str>)], || {
            let matches = with_args(Command::new("test")).get_matches_from(vec!["test"]);
            assert!(matches!(log_format(&matches), Ok(LogFormat::Pretty)));
        });
    }
}
