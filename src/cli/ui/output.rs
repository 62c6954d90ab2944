use console::style;

use crate::types::ClassifiedError;

pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", style("✓").green(), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", style("⚠").yellow(), message);
    }

    pub fn header(&self, message: &str) {
        println!("\n{}", style(message).bold().underlined());
    }

    pub fn section(&self, message: &str) {
        println!("\n{}", style(message).bold());
        println!("{}", "─".repeat(40));
    }

    pub fn field(&self, key: &str, value: &str) {
        println!("  {:<14} {}", style(key).dim(), value);
    }

    /// Print a classified failure with its retry hint
    pub fn failure(&self, error: &ClassifiedError) {
        eprintln!("{}", describe(error));
        if error.is_retryable() {
            eprintln!("  {}", style("This can be retried.").dim());
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line summary: `✗ [CODE] message: detail`
pub fn describe(error: &ClassifiedError) -> String {
    let mut line = format!(
        "{} [{}] {}",
        style("✗").red(),
        style(error.code()).red().bold(),
        error.message()
    );
    if let Some(detail) = error.detail() {
        line.push_str(&format!(": {}", detail));
    }
    line
}
