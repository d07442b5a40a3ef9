//! Screen model: the authoritative picture of the remote terminal.
//!
//! The serial device has no read-back channel, so this model is the single
//! source of truth for what the terminal currently displays. Every byte
//! that reaches the wire is derived from it, and the correctness contract
//! is: after any sequence of writes, flushing the model's output leaves
//! the physical screen identical to the model.
//!
//! Two snapshots are kept: the current grid and the last-flushed grid.
//! `diff` computes the minimal contiguous runs that differ between them;
//! `append_stream` is the fast path for sequential output and keeps both
//! snapshots in lockstep while returning verbatim wire bytes.

pub mod cell;
pub mod cursor;
pub mod grid;

pub use cell::{sanitize, Cell, PLACEHOLDER};
pub use cursor::Cursor;
pub use grid::{Grid, Line};

use log::debug;

use crate::ansi;

/// One contiguous changed span within a single row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub row: usize,
    pub col: usize,
    pub text: String,
}

/// In-memory model of the terminal screen and cursor.
#[derive(Debug)]
pub struct ScreenModel {
    grid: Grid,
    /// Glyphs as last flushed to the device.
    flushed: Grid,
    cursor: Cursor,
    /// Where the physical cursor sits, when known. `None` after run
    /// emission leaves it at the end of an arbitrary run.
    flushed_cursor: Option<(usize, usize)>,
    /// Count of charset substitutions performed so far.
    substitutions: u64,
}

impl ScreenModel {
    pub fn new(rows: usize, cols: usize) -> Self {
        ScreenModel {
            grid: Grid::new(rows, cols),
            flushed: Grid::new(rows, cols),
            cursor: Cursor::default(),
            flushed_cursor: None,
            substitutions: 0,
        }
    }

    pub fn rows(&self) -> usize {
        self.grid.rows()
    }

    pub fn cols(&self) -> usize {
        self.grid.cols()
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    /// Charset substitutions recorded since construction.
    pub fn substitutions(&self) -> u64 {
        self.substitutions
    }

    /// Write text at the cursor, advancing it.
    ///
    /// With `wrap` set, reaching the column bound moves to the next row
    /// (scrolling at the last row, which exposes a clean blank bottom
    /// row); without it, overflow is truncated silently and the decision
    /// is the caller's. `\n` advances the line, `\r` returns to column 0;
    /// anything else unprintable is substituted and recorded.
    pub fn write_text(&mut self, text: &str, wrap: bool) {
        for c in text.chars() {
            match c {
                '\n' => self.line_advance(),
                '\r' => {
                    self.cursor.col = 0;
                    self.cursor.pending_wrap = false;
                }
                _ => {
                    if self.cursor.pending_wrap {
                        if wrap {
                            self.line_advance();
                        } else {
                            continue;
                        }
                    }
                    let glyph = self.sanitize_glyph(c);
                    self.put_glyph(glyph);
                }
            }
        }
    }

    /// Write text at an absolute position without disturbing the cursor.
    /// Truncates at the end of the row.
    pub fn write_at(&mut self, row: usize, col: usize, text: &str) {
        let saved = self.cursor;
        self.cursor = Cursor::at(
            row.min(self.rows() - 1),
            col.min(self.cols() - 1),
        );
        self.write_text(text, false);
        self.cursor = saved;
    }

    /// Move the cursor, clamped to the grid bounds.
    ///
    /// Returns the cursor-addressing escape for the caller to hand to the
    /// output pump; the model itself emits nothing.
    pub fn move_cursor(&mut self, row: usize, col: usize) -> Vec<u8> {
        self.cursor = Cursor::at(
            row.min(self.rows() - 1),
            col.min(self.cols() - 1),
        );
        ansi::cup(self.cursor.row, self.cursor.col)
    }

    /// Blank the screen and home the cursor. The caller resynchronizes
    /// the device with `full_redraw`.
    pub fn clear(&mut self) {
        self.grid.clear();
        self.cursor = Cursor::default();
        self.refresh_dirty();
    }

    /// Compute the minimal set of contiguous changed runs per row against
    /// the last-flushed snapshot, marking them flushed.
    ///
    /// Adjacent changed cells coalesce into a single span, so the escape
    /// overhead of a flush is bounded by the number of changed runs, not
    /// the number of changed cells.
    pub fn diff(&mut self) -> Vec<Run> {
        let mut runs = Vec::new();
        for row in 0..self.rows() {
            let mut run: Option<Run> = None;
            for col in 0..self.cols() {
                let glyph = self.grid.cell(row, col).glyph;
                let changed = self.grid.cell(row, col).dirty
                    && glyph != self.flushed.cell(row, col).glyph;
                if changed {
                    self.flushed.cell_mut(row, col).glyph = glyph;
                    run.get_or_insert_with(|| Run {
                        row,
                        col,
                        text: String::new(),
                    })
                    .text
                    .push(glyph as char);
                } else if let Some(done) = run.take() {
                    runs.push(done);
                }
                self.grid.cell_mut(row, col).dirty = false;
            }
            if let Some(done) = run.take() {
                runs.push(done);
            }
        }
        if !runs.is_empty() {
            // Emitting the runs will leave the physical cursor at the end
            // of the last span.
            self.flushed_cursor = None;
        }
        runs
    }

    /// Byte sequence repainting the entire screen: clear, every non-blank
    /// row, cursor restore. Also used to resynchronize the device after
    /// suspected corruption. Calling it twice without intervening writes
    /// yields identical bytes.
    pub fn full_redraw(&mut self) -> Vec<u8> {
        let mut out = ansi::clear_screen();
        for row in 0..self.rows() {
            let end = self.grid.line(row).trailing_blank_start();
            if end == 0 {
                continue;
            }
            out.extend(ansi::cup(row, 0));
            for col in 0..end {
                out.push(self.grid.cell(row, col).glyph);
            }
        }
        out.extend(ansi::cup(self.cursor.row, self.cursor.col));

        self.flushed = self.grid.clone();
        for row in 0..self.rows() {
            for col in 0..self.cols() {
                self.grid.cell_mut(row, col).dirty = false;
            }
        }
        self.flushed_cursor = Some(self.cursor.position());
        out
    }

    /// Escape bytes moving the physical cursor to the model cursor, empty
    /// when it is already there. Assumes the caller transmits them.
    pub fn sync_cursor(&mut self) -> Vec<u8> {
        if self.flushed_cursor == Some(self.cursor.position()) {
            return Vec::new();
        }
        self.flushed_cursor = Some(self.cursor.position());
        ansi::cup(self.cursor.row, self.cursor.col)
    }

    /// Character-stream output: write `text` at the cursor and return the
    /// exact wire bytes, keeping the flushed snapshot in lockstep.
    ///
    /// Printable fragments come back byte-for-byte; every line advance is
    /// emitted as CR+LF (bare LF from the input is normalized); `\x08`
    /// steps the cursor left for line editing. Scrolling at the bottom row
    /// happens on both the model and the device at once, which is what
    /// lets the wire bytes stay verbatim.
    pub fn append_stream(&mut self, text: &str) -> Vec<u8> {
        let mut out = self.sync_cursor();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\r' => {
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                        self.stream_newline(&mut out);
                    } else {
                        self.cursor.col = 0;
                        self.cursor.pending_wrap = false;
                        out.push(b'\r');
                    }
                }
                '\n' => self.stream_newline(&mut out),
                '\x08' => {
                    self.cursor.pending_wrap = false;
                    if self.cursor.col > 0 {
                        self.cursor.col -= 1;
                        out.push(0x08);
                    }
                }
                _ => {
                    if self.cursor.pending_wrap {
                        self.stream_newline(&mut out);
                    }
                    let glyph = self.sanitize_glyph(c);
                    let (row, col) = self.cursor.position();
                    self.grid.cell_mut(row, col).glyph = glyph;
                    self.grid.cell_mut(row, col).dirty = false;
                    self.flushed.cell_mut(row, col).glyph = glyph;
                    out.push(glyph);
                    if col + 1 == self.cols() {
                        self.cursor.pending_wrap = true;
                    } else {
                        self.cursor.col += 1;
                    }
                }
            }
        }
        self.flushed_cursor = Some(self.cursor.position());
        out
    }

    fn sanitize_glyph(&mut self, c: char) -> u8 {
        let (glyph, substituted) = sanitize(c);
        if substituted {
            self.substitutions += 1;
            debug!("substituted unrepresentable character {:?}", c);
        }
        glyph
    }

    fn put_glyph(&mut self, glyph: u8) {
        let (row, col) = self.cursor.position();
        let cell = self.grid.cell_mut(row, col);
        cell.glyph = glyph;
        cell.dirty = glyph != self.flushed.cell(row, col).glyph;
        if col + 1 == self.cols() {
            self.cursor.pending_wrap = true;
        } else {
            self.cursor.col += 1;
        }
    }

    /// Model-side line advance: column 0 plus row step, scrolling at the
    /// last row. The newly exposed bottom row is blank, and its dirty
    /// state is recomputed against the (unscrolled) flushed snapshot.
    fn line_advance(&mut self) {
        self.cursor.col = 0;
        self.cursor.pending_wrap = false;
        if self.cursor.row + 1 == self.rows() {
            self.grid.scroll_up();
            self.refresh_dirty();
        } else {
            self.cursor.row += 1;
        }
    }

    /// Wire-synchronized line advance for `append_stream`: CR+LF goes out
    /// and the device scrolls with the model, so both flushed snapshots
    /// shift identically and the exposed bottom row is clean.
    fn stream_newline(&mut self, out: &mut Vec<u8>) {
        out.extend_from_slice(b"\r\n");
        self.cursor.col = 0;
        self.cursor.pending_wrap = false;
        if self.cursor.row + 1 == self.rows() {
            self.grid.scroll_up();
            self.flushed.scroll_up();
        } else {
            self.cursor.row += 1;
        }
    }

    /// Recompute every dirty flag against the flushed snapshot. Needed
    /// when grid content moves without a matching device-side change.
    fn refresh_dirty(&mut self) {
        for row in 0..self.rows() {
            for col in 0..self.cols() {
                let flushed_glyph = self.flushed.cell(row, col).glyph;
                let cell = self.grid.cell_mut(row, col);
                cell.dirty = cell.glyph != flushed_glyph;
            }
        }
    }

    #[cfg(test)]
    fn row_text(&self, row: usize) -> String {
        let end = self.grid.line(row).trailing_blank_start();
        (0..end)
            .map(|col| self.grid.cell(row, col).glyph as char)
            .collect()
    }
}
