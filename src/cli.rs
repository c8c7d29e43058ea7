use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "signage-sync")]
#[command(version)]
#[command(about = "Signage player fleet sync and addon runtime", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Install directory holding config.json, Addons/, Media/, Fonts/.
    /// Defaults to the executable's directory.
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run discovery, liveness polling and addons until Ctrl-C.
    Serve,
    /// Scan the addons directory and print what was found.
    Addons,
    /// Listen for peers for a while and print the table.
    Peers {
        #[arg(long, default_value = "12")]
        wait: u64,
    },
    /// Call a function exported by an addon backend and print its result.
    Call { addon: String, function: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_none() {
        let args = Args::parse_from(["signage-sync"]);
        assert!(args.command.is_none());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_peers_wait_and_global_flags() {
        let args = Args::parse_from(["signage-sync", "peers", "--wait", "3", "--base-dir", "/opt/signage"]);
        assert_eq!(args.command, Some(Command::Peers { wait: 3 }));
        assert_eq!(args.base_dir, Some(PathBuf::from("/opt/signage")));
    }

    #[test]
    fn test_call_takes_addon_and_function() {
        let args = Args::parse_from(["signage-sync", "call", "clock", "refresh"]);
        assert_eq!(
            args.command,
            Some(Command::Call {
                addon: "clock".into(),
                function: "refresh".into(),
            })
        );
    }
}
