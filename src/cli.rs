use std::io::{self, IsTerminal};

use crate::RequestedColorMode;

pub(crate) mod list;
pub(crate) mod refresh;
pub(crate) mod serve;

/// Whether operator diagnostics (`warning:`/`error:` lines on stderr) are
/// painted. Listings on stdout are never colored, so they stay safe to pipe.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum_macros::Display)]
pub(crate) enum ColorMode {
    On,
    Off,
}

impl ColorMode {
    fn decide(requested: RequestedColorMode, no_color_set: bool, stderr_is_tty: bool) -> ColorMode {
        match requested {
            RequestedColorMode::On => ColorMode::On,
            RequestedColorMode::Off => ColorMode::Off,
            RequestedColorMode::Auto if no_color_set || !stderr_is_tty => ColorMode::Off,
            RequestedColorMode::Auto => ColorMode::On,
        }
    }

    /// Settles `--color auto` against `NO_COLOR` and the terminal the
    /// diagnostics go to. `serve` logs through tracing and is unaffected.
    pub(crate) fn resolve_auto(requested: RequestedColorMode) -> ColorMode {
        ColorMode::decide(
            requested,
            std::env::var_os("NO_COLOR").is_some(),
            io::stderr().is_terminal(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_choice_wins() {
        assert_eq!(ColorMode::decide(RequestedColorMode::On, true, false), ColorMode::On);
        assert_eq!(ColorMode::decide(RequestedColorMode::Off, false, true), ColorMode::Off);
    }

    #[test]
    fn test_auto_follows_environment() {
        assert_eq!(ColorMode::decide(RequestedColorMode::Auto, false, true), ColorMode::On);
        assert_eq!(ColorMode::decide(RequestedColorMode::Auto, true, true), ColorMode::Off);
        assert_eq!(ColorMode::decide(RequestedColorMode::Auto, false, false), ColorMode::Off);
    }
}
