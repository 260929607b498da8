//! Fixed-size terminal grid, the sink of write effects.
//!
//! Mirrors a classic teaching terminal: a width×height character grid with
//! a cursor on the last line. Long lines wrap at the width; once the grid
//! is full the oldest line scrolls off. Cloning is cheap enough to ride
//! along in every machine state.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TermBuffer {
    width: usize,
    height: usize,
    lines: Vec<String>,
}

impl TermBuffer {
    pub fn new(width: usize, height: usize) -> Self {
        TermBuffer {
            width: width.max(1),
            height: height.max(1),
            lines: vec![String::new()],
        }
    }

    /// Append `text`, honoring newlines, wrapping, and scrolling.
    pub fn write_str(&mut self, text: &str) {
        for ch in text.chars() {
            if ch == '\n' {
                self.newline();
                continue;
            }
            if self.cursor_line_len() >= self.width {
                self.newline();
            }
            if let Some(line) = self.lines.last_mut() {
                line.push(ch);
            }
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The whole visible grid as one newline-joined string.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn cursor_line_len(&self) -> usize {
        self.lines.last().map_or(0, |line| line.chars().count())
    }

    fn newline(&mut self) {
        self.lines.push(String::new());
        if self.lines.len() > self.height {
            self.lines.remove(0);
        }
    }
}
