use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Display;
use std::time::Duration;

pub(crate) fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub(crate) fn section(title: &str) {
    println!("{}", style(title).cyan().bold());
    println!("{}", style("─".repeat(50)).dim());
}

/// Prints aligned `label: value` rows.
pub(crate) fn key_values(rows: &[(&str, String)]) {
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in rows {
        let label = format!("{:width$}", key, width = width);
        println!("  {}  {}", style(label).bold(), value);
    }
}

pub(crate) fn success(msg: impl Display) {
    println!("{} {}", style("✓").green(), msg);
}

pub(crate) fn warning(msg: impl Display) {
    println!("{} {}", style("!").yellow(), msg);
}

pub(crate) fn failure(msg: impl Display) {
    eprintln!("{} {}", style("✗").red(), msg);
}

pub(crate) fn yes_no(value: bool) -> String {
    if value {
        style("yes").green().to_string()
    } else {
        style("no").red().to_string()
    }
}

pub(crate) fn muted(value: impl Display) -> String {
    style(value).dim().to_string()
}
