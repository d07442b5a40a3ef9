//! Cursor state for the screen model.

/// Cursor position within the grid.
///
/// Wrap is deferred the way physical VT100-class terminals defer it:
/// writing to the last column leaves the cursor on that column with
/// `pending_wrap` set, and the wrap happens when the next printable
/// arrives. Keeping the model on the same discipline as the device is
/// what lets the character-stream output path stay byte-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    /// Row, 0-indexed from the top.
    pub row: usize,
    /// Column, 0-indexed.
    pub col: usize,
    /// Set after writing to the last column; cleared by any motion.
    pub pending_wrap: bool,
}

impl Cursor {
    pub fn at(row: usize, col: usize) -> Self {
        Cursor {
            row,
            col,
            pending_wrap: false,
        }
    }

    /// Position as a `(row, col)` pair, ignoring the wrap flag.
    pub fn position(&self) -> (usize, usize) {
        (self.row, self.col)
    }
}
