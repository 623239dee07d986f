use clap::{Arg, ArgAction, ArgMatches, Command};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Serve,
    /// Drop every `user:*:session` marker from the session cache.
    ClearSessions,
    /// Delete users and account links, then the session markers.
    ClearAuthData,
}

pub fn new() -> Command {
    Command::new("authgate")
        .about("Session authentication service")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand(Command::new("serve").about("Run the HTTP server (default)"))
        .subcommand(
            Command::new("clear-sessions").about("Remove all session markers from the cache"),
        )
        .subcommand(
            Command::new("clear-auth-data")
                .about("Delete all users, linked accounts and session markers")
                .arg(
                    Arg::new("yes")
                        .long("yes")
                        .help("Confirm the deletion")
                        .action(ArgAction::SetTrue),
                ),
        )
}

pub fn handler(matches: &ArgMatches) -> anyhow::Result<Action> {
    match matches.subcommand() {
        None | Some(("serve", _)) => Ok(Action::Serve),
        Some(("clear-sessions", _)) => Ok(Action::ClearSessions),
        Some(("clear-auth-data", sub)) => {
            anyhow::ensure!(
                sub.get_flag("yes"),
                "clear-auth-data deletes every user; pass --yes to confirm"
            );
            Ok(Action::ClearAuthData)
        }
        Some((other, _)) => anyhow::bail!("unknown command: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(args: &[&str]) -> anyhow::Result<Action> {
        let matches = new().try_get_matches_from(args)?;
        handler(&matches)
    }

    #[test]
    fn no_subcommand_serves() {
        assert_eq!(action(&["authgate"]).unwrap(), Action::Serve);
        assert_eq!(action(&["authgate", "serve"]).unwrap(), Action::Serve);
    }

    #[test]
    fn clear_sessions() {
        assert_eq!(
            action(&["authgate", "clear-sessions"]).unwrap(),
            Action::ClearSessions
        );
    }

    #[test]
    fn clear_auth_data_needs_confirmation() {
        assert!(action(&["authgate", "clear-auth-data"]).is_err());
        assert_eq!(
            action(&["authgate", "clear-auth-data", "--yes"]).unwrap(),
            Action::ClearAuthData
        );
    }

    #[test]
    fn unknown_subcommand_is_rejected() {
        assert!(action(&["authgate", "drop-tables"]).is_err());
    }
}
