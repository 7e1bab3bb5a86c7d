//! Colored diagnostics for the command line. The gateway itself logs through
//! `tracing`; these are for messages aimed at the operator's terminal.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use nu_ansi_term::Color;

use crate::cli::ColorMode;

pub const DEFAULT_EXIT_CODE: i32 = 1;

static USE_COLOR: AtomicBool = AtomicBool::new(true);

pub(crate) fn configure_color(cmode: ColorMode) {
    USE_COLOR.store(matches!(cmode, ColorMode::On), Ordering::Relaxed);
}

fn use_color() -> ColorMode {
    match USE_COLOR.load(Ordering::Relaxed) {
        true => ColorMode::On,
        false => ColorMode::Off,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Warning,
    Error,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Warning => "warning:",
            Severity::Error => "error:",
        }
    }

    fn color(self) -> Color {
        match self {
            Severity::Warning => Color::Yellow,
            Severity::Error => Color::Red,
        }
    }
}

fn write_diagnostic<W: Write>(
    out: &mut W,
    cmode: ColorMode,
    severity: Severity,
    text: &str,
) -> io::Result<()> {
    match cmode {
        ColorMode::On => writeln!(
            out,
            "{} {}",
            severity.color().bold().paint(severity.label()),
            Color::Default.bold().paint(text)
        ),
        ColorMode::Off => writeln!(out, "{} {}", severity.label(), text),
    }
}

pub(crate) fn report(severity: Severity, text: &str) {
    // Nothing sensible to do if stderr itself is gone
    let _ = write_diagnostic(&mut io::stderr().lock(), use_color(), severity, text);
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => ({
        let formatted = format!($($arg)*);
        $crate::utils::errors::report($crate::utils::errors::Severity::Warning, &formatted);
    })
}

#[macro_export]
macro_rules! die {
    ($($arg:tt)*) => ({
        let formatted = format!($($arg)*);
        $crate::utils::errors::report($crate::utils::errors::Severity::Error, &formatted);
        ::std::process::exit($crate::utils::errors::DEFAULT_EXIT_CODE);
    })
}
