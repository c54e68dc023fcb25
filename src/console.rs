//! Console output formatting with ANSI color support.
//!
//! Provides styled terminal output with automatic TTY detection
//! and respect for the NO_COLOR environment variable.

use std::io::{self, IsTerminal, Write};

/// ANSI style codes for terminal formatting.
#[derive(Debug, Clone, Copy)]
pub enum Style {
    Bold,
    Dim,
    Italic,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    Gray,
}

impl Style {
    /// Returns the ANSI escape code for this style.
    fn code(self) -> &'static str {
        match self {
            Style::Bold => "1",
            Style::Dim => "2",
            Style::Italic => "3",
            Style::Red => "31",
            Style::Green => "32",
            Style::Yellow => "33",
            Style::Blue => "34",
            Style::Magenta => "35",
            Style::Cyan => "36",
            Style::Gray => "90",
        }
    }
}

const RESET: &str = "\x1b[0m";

/// Width of the rule printed between chapters.
const DIVIDER_WIDTH: usize = 40;

/// Console output handler with color support detection.
#[derive(Debug, Clone)]
pub struct Console {
    colors_enabled: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    /// Creates a new Console instance, detecting color support.
    ///
    /// Colors are disabled if:
    /// - The `NO_COLOR` environment variable is set
    /// - stdout is not a terminal (TTY)
    pub fn new() -> Self {
        let colors_enabled = std::env::var("NO_COLOR").is_err() && io::stdout().is_terminal();

        Self { colors_enabled }
    }

    /// Creates a Console with colors explicitly enabled or disabled.
    pub fn with_colors(enabled: bool) -> Self {
        Self {
            colors_enabled: enabled,
        }
    }

    /// Applies ANSI styles to text if colors are enabled.
    pub fn style(&self, text: &str, styles: &[Style]) -> String {
        if !self.colors_enabled || styles.is_empty() {
            return text.to_string();
        }

        let codes: Vec<&str> = styles.iter().map(|s| s.code()).collect();
        format!("\x1b[{}m{}{}", codes.join(";"), text, RESET)
    }

    /// Creates a colored label like `[INFO]`.
    pub fn label(&self, label: &str, color: Style) -> String {
        let styled = self.style(label, &[color, Style::Bold]);
        format!("[{}]", styled)
    }

    /// Prints an info message with blue `[INFO]` label.
    pub fn info(&self, message: &str) {
        println!("{} {}", self.label("INFO", Style::Blue), message);
    }

    /// Prints a success message with green `[OK]` label.
    pub fn success(&self, message: &str) {
        println!("{} {}", self.label("OK", Style::Green), message);
    }

    /// Prints a warning message with yellow `[WARN]` label.
    pub fn warning(&self, message: &str) {
        println!("{} {}", self.label("WARN", Style::Yellow), message);
    }

    /// Prints an error message with red `[ERROR]` label.
    pub fn error(&self, message: &str) {
        eprintln!("{} {}", self.label("ERROR", Style::Red), message);
    }

    /// Prints a step message with cyan `[STEP]` label.
    pub fn step(&self, message: &str) {
        println!("{} {}", self.label("STEP", Style::Cyan), message);
    }

    /// Prints a section header in magenta bold.
    pub fn section(&self, message: &str) {
        println!();
        println!("{}", self.style(message, &[Style::Magenta, Style::Bold]));
    }

    /// Returns text styled as muted (dim gray).
    pub fn muted(&self, text: &str) -> String {
        self.style(text, &[Style::Gray, Style::Dim])
    }

    /// Prints a progress message with cyan `[..]` label and flushes.
    pub fn progress(&self, message: &str) {
        print!("{} {}", self.label("..", Style::Cyan), message);
        let _ = io::stdout().flush();
    }

    /// Clears the current line (for progress updates).
    pub fn clear_line(&self) {
        if self.colors_enabled {
            print!("\r\x1b[2K");
        } else {
            println!();
        }
        let _ = io::stdout().flush();
    }

    /// Formats a chapter title with its 1-based position in the book.
    pub fn chapter_heading(&self, chapter_index: usize, chapter_count: usize, title: &str) -> String {
        let position = self.style(
            &format!("[Chapter {}/{}]", chapter_index + 1, chapter_count),
            &[Style::Cyan, Style::Bold],
        );
        format!("{} {}", position, self.style(title, &[Style::Bold]))
    }

    /// Prints a paragraph followed by a blank line.
    pub fn paragraph(&self, text: &str) {
        println!("{}", text);
        println!();
    }

    /// Prints a horizontal rule.
    pub fn divider(&self) {
        println!("{}", self.muted(&"-".repeat(DIVIDER_WIDTH)));
    }

    /// Prints a line spoken by the narrator.
    pub fn narration(&self, voice: &str, text: &str) {
        println!("{} {}", self.label(voice, Style::Magenta), self.style(text, &[Style::Italic]));
    }
}
