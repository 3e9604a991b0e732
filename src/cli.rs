use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Saves a JPEG snapshot of a WHEP video stream at a fixed interval.
#[derive(Debug, Default, Parser)]
#[command(version, about)]
pub struct Args {
    /// Settings file; TOML, YAML and JSON are recognised by extension
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// WHEP endpoint the SDP offer is posted to
    #[arg(long)]
    pub url: Option<Url>,

    /// Bearer token sent with the offer
    #[arg(long)]
    pub token: Option<String>,

    /// Snapshot file, overwritten on every capture
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Milliseconds between snapshots
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Default log level (error, warn, info, debug, trace); RUST_LOG wins
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn overrides_are_parsed() {
        let args = Args::try_parse_from([
            "whep-snapshot",
            "--url",
            "https://example.com/whep/live",
            "--token",
            "abc",
            "-o",
            "out/snap.jpg",
            "--interval-ms",
            "5000",
        ])
        .unwrap();

        assert_eq!(args.url.unwrap().as_str(), "https://example.com/whep/live");
        assert_eq!(args.token.as_deref(), Some("abc"));
        assert_eq!(args.output, Some(PathBuf::from("out/snap.jpg")));
        assert_eq!(args.interval_ms, Some(5000));
        assert!(args.config.is_none());
    }

    #[test]
    fn every_flag_has_help() {
        let command = Args::command();
        for arg in command.get_arguments() {
            if matches!(arg.get_id().as_str(), "help" | "version") {
                continue;
            }
            assert!(arg.get_help().is_some(), "--{} has no help", arg.get_id());
        }
        let help = Args::command().render_help().to_string();
        assert!(help.contains("Milliseconds between snapshots"));
    }

    #[test]
    fn malformed_url_is_rejected() {
        assert!(Args::try_parse_from(["whep-snapshot", "--url", "not a url"]).is_err());
    }
}
