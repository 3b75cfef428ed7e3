use std::time::Duration;

use clap::{Parser, Subcommand};
use mdns_core::{QueryMode, RecordType};

/// One-shot mDNS and DNS-SD lookups on the local link
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "mdns-client")]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Seconds to wait for answers
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    /// TOML file holding an engine config
    #[arg(long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List service types on the link
    Services,
    /// List and resolve instances of a service type
    Browse {
        /// e.g. `_ipp._tcp`
        service_type: String,
    },
    /// Resolve one instance
    Resolve {
        /// e.g. `printer._ipp._tcp`
        instance: String,
    },
    /// Print raw answers
    Query {
        name: String,
        /// A, AAAA, PTR, SRV, TXT, ANY or TYPEnnn
        #[arg(value_parser = parse_rtype)]
        rtype: RecordType,
        /// Keep asking until the timeout runs out
        #[arg(long)]
        watch: bool,
    },
}

impl Command {
    pub fn query_mode(watch: bool) -> QueryMode {
        if watch {
            QueryMode::Continuous
        } else {
            QueryMode::OneShot
        }
    }
}

fn parse_rtype(s: &str) -> Result<RecordType, String> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Result<Options, clap::Error> {
        Options::try_parse_from(std::iter::once("mdns-client").chain(s.split_whitespace()))
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("services").unwrap().command, Command::Services);
        assert_eq!(
            parse("browse _ipp._tcp").unwrap().command,
            Command::Browse {
                service_type: "_ipp._tcp".to_string()
            }
        );
        assert_eq!(
            parse("resolve printer._ipp._tcp").unwrap().command,
            Command::Resolve {
                instance: "printer._ipp._tcp".to_string()
            }
        );
        assert_eq!(
            parse("query alpha.local aaaa --watch").unwrap().command,
            Command::Query {
                name: "alpha.local".to_string(),
                rtype: RecordType::Aaaa,
                watch: true,
            }
        );
        assert_eq!(Command::query_mode(true), QueryMode::Continuous);
        assert_eq!(Command::query_mode(false), QueryMode::OneShot);
    }

    #[test]
    fn test_parse_options() {
        let options = parse("--timeout 10 --config engine.toml services").unwrap();
        assert_eq!(options.timeout(), Duration::from_secs(10));
        assert_eq!(options.config.as_deref(), Some("engine.toml"));

        let options = parse("services").unwrap();
        assert_eq!(options.timeout(), Duration::from_secs(3));
        assert_eq!(options.config, None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("browse").is_err());
        assert!(parse("query alpha.local BOGUS").is_err());
        assert!(parse("--timeout soon services").is_err());
        assert!(parse("--verbose services").is_err());
    }
}
