//! Output helpers.
//!
//! Result paths go to stdout so scripts can capture them; everything else
//! goes to stderr.

use std::path::Path;

use colored::Colorize;

/// Print a result path on stdout.
pub fn print_path(path: &Path) {
    println!("{}", path.display());
}

/// Print a success message.
pub fn print_success(message: &str) {
    eprintln!("{} {}", "Success:".green().bold(), message);
}
