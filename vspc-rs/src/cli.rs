//! Command-line argument parsing.
//!
//! Usage:
//!   vspc [--config-file <file>] [--<option> <value>]... [--enable-clients]
//!
//! Every config-file option has a `--kebab-case` twin; command-line values
//! override the file.  Values may be attached with `=` or passed as the
//! next argument.

use std::path::PathBuf;

use crate::config::Settings;

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// `--config-file <file>`: config file to load before the overrides.
    pub config_file: Option<PathBuf>,
    /// Options given directly on the command line.
    pub overrides: Settings,
}

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    let raw: Vec<String> = std::env::args().collect();
    parse_argv(&raw[1..])
}

/// Parse a slice of argument strings (exposed for testing).
pub fn parse_argv(argv: &[String]) -> Result<CliArgs, String> {
    let mut args = CliArgs::default();
    let mut i = 0;

    while i < argv.len() {
        let arg = argv[i].as_str();
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) => (f, Some(v.to_owned())),
            None => (arg, None),
        };

        // Switches take no value.
        if flag == "--enable-clients" {
            if inline.is_some() {
                return Err(format!("option {flag} takes no value"));
            }
            args.overrides.enable_clients = Some(true);
            i += 1;
            continue;
        }

        // Everything else requires one.
        let value = match inline {
            Some(v) => v,
            None => {
                i += 1;
                argv.get(i)
                    .cloned()
                    .ok_or_else(|| format!("option {flag} requires a value"))?
            }
        };

        match flag {
            "--config-file" => args.config_file = Some(PathBuf::from(value)),
            "--host" => args.overrides.host = Some(value),
            "--port" => args.overrides.port = Some(parse_port(flag, &value)?),
            "--client-host" => args.overrides.client_host = Some(value),
            "--vm-start-port" => args.overrides.vm_start_port = Some(parse_port(flag, &value)?),
            "--admin-host" => args.overrides.admin_host = Some(value),
            "--admin-port" => args.overrides.admin_port = Some(parse_port(flag, &value)?),
            "--cert" => args.overrides.cert = Some(PathBuf::from(value)),
            "--key" => args.overrides.key = Some(PathBuf::from(value)),
            "--uri" => args.overrides.uri = Some(value),
            "--serial-log-dir" => args.overrides.serial_log_dir = Some(PathBuf::from(value)),
            other => return Err(format!("illegal option -- {other}")),
        }
        i += 1;
    }

    Ok(args)
}

fn parse_port(flag: &str, value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| format!("invalid port for {flag}: '{value}'"))
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_argv_is_all_defaults() {
        let args = parse_argv(&[]).unwrap();
        assert!(args.config_file.is_none());
        assert!(args.overrides.port.is_none());
    }

    #[test]
    fn separate_and_inline_values_both_work() {
        let args = parse_argv(&argv(&[
            "--port",
            "1234",
            "--uri=vspc://x",
            "--serial-log-dir",
            "/var/log/vspc",
        ]))
        .unwrap();
        assert_eq!(args.overrides.port, Some(1234));
        assert_eq!(args.overrides.uri.as_deref(), Some("vspc://x"));
        assert_eq!(
            args.overrides.serial_log_dir,
            Some(PathBuf::from("/var/log/vspc"))
        );
    }

    #[test]
    fn enable_clients_is_a_switch() {
        let args = parse_argv(&argv(&["--enable-clients"])).unwrap();
        assert_eq!(args.overrides.enable_clients, Some(true));
        assert!(parse_argv(&argv(&["--enable-clients=true"])).is_err());
    }

    #[test]
    fn config_file_flag() {
        let args = parse_argv(&argv(&["--config-file", "/etc/vspc.conf"])).unwrap();
        assert_eq!(args.config_file, Some(PathBuf::from("/etc/vspc.conf")));
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(parse_argv(&argv(&["--port"])).is_err());
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(parse_argv(&argv(&["--port", "high"])).is_err());
    }

    #[test]
    fn unknown_flag_is_an_error() {
        let err = parse_argv(&argv(&["--frobnicate", "1"])).unwrap_err();
        assert!(err.contains("frobnicate"));
    }
}
