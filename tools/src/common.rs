// Common functions between tools

use std::time::Duration;

use clap::{Arg, ArgMatches, Command, value_parser};
use springboard_remote::provider::{Address, ProviderConfig, TcpProvider};

/// Adds the connection flags every tool accepts
pub fn connection_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .env("SPRINGBOARD_HOST")
                .default_value("127.0.0.1")
                .help("Address of the device tunnel"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .env("SPRINGBOARD_PORT")
                .default_value("62078")
                .value_parser(value_parser!(u16))
                .help("Port the shim service is advertised on"),
        )
        .arg(
            Arg::new("label")
                .long("label")
                .value_name("LABEL")
                .help("Label sent during service check-in"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .help("Seconds to wait for each reply"),
        )
        .arg(
            Arg::new("about")
                .long("about")
                .help("Show about information")
                .action(clap::ArgAction::SetTrue),
        )
}

pub fn get_provider(matches: &ArgMatches, default_label: &str) -> Result<TcpProvider, String> {
    let host = matches
        .get_one::<String>("host")
        .ok_or_else(|| "No host passed".to_string())?;
    let port = *matches
        .get_one::<u16>("port")
        .ok_or_else(|| "No port passed".to_string())?;

    let mut config = ProviderConfig::default().with_label(
        matches
            .get_one::<String>("label")
            .map(String::as_str)
            .unwrap_or(default_label),
    );
    if let Some(secs) = matches.get_one::<u64>("timeout") {
        config = config.with_request_timeout(Duration::from_secs(*secs));
    }

    Ok(TcpProvider::new(Address::new(host.as_str(), port)).with_config(config))
}
