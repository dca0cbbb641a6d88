/// A resizable grid of lines with a cursor.
///
/// Lines grow on demand; writing past the end of a line pads it with
/// spaces. Rows and columns are unbounded, the projection is trimmed when
/// snapshotted.
#[derive(Debug, Clone)]
pub struct Screen {
    lines: Vec<Vec<char>>,
    row: usize,
    col: usize,
    saved_cursor: Option<(usize, usize)>,
}

impl Screen {
    pub fn new() -> Self {
        Self {
            lines: vec![Vec::new()],
            row: 0,
            col: 0,
            saved_cursor: None,
        }
    }

    pub fn reset(&mut self) {
        self.lines = vec![Vec::new()];
        self.row = 0;
        self.col = 0;
        self.saved_cursor = None;
    }

    pub fn cursor(&self) -> (usize, usize) {
        (self.row, self.col)
    }

    fn ensure_row(&mut self) {
        while self.lines.len() <= self.row {
            self.lines.push(Vec::new());
        }
    }

    pub fn put_char(&mut self, ch: char) {
        self.ensure_row();
        let line = &mut self.lines[self.row];
        while line.len() < self.col {
            line.push(' ');
        }
        if self.col < line.len() {
            line[self.col] = ch;
        } else {
            line.push(ch);
        }
        self.col += 1;
    }

    pub fn carriage_return(&mut self) {
        self.col = 0;
    }

    pub fn line_feed(&mut self) {
        self.row += 1;
        self.col = 0;
        self.ensure_row();
    }

    pub fn backspace(&mut self) {
        self.col = self.col.saturating_sub(1);
    }

    pub fn tab(&mut self) {
        self.col = (self.col / 8 + 1) * 8;
    }

    pub fn cursor_up(&mut self, n: usize) {
        self.row = self.row.saturating_sub(n.max(1));
    }

    pub fn cursor_down(&mut self, n: usize) {
        self.row += n.max(1);
        self.ensure_row();
    }

    pub fn cursor_forward(&mut self, n: usize) {
        self.col += n.max(1);
    }

    pub fn cursor_back(&mut self, n: usize) {
        self.col = self.col.saturating_sub(n.max(1));
    }

    pub fn next_line(&mut self, n: usize) {
        self.row += n.max(1);
        self.col = 0;
        self.ensure_row();
    }

    pub fn prev_line(&mut self, n: usize) {
        self.row = self.row.saturating_sub(n.max(1));
        self.col = 0;
    }

    pub fn set_col(&mut self, col_one_based: usize) {
        self.col = col_one_based.saturating_sub(1);
    }

    pub fn set_position(&mut self, row_one_based: usize, col_one_based: usize) {
        self.row = row_one_based.saturating_sub(1);
        self.col = col_one_based.saturating_sub(1);
        self.ensure_row();
    }

    pub fn save_cursor(&mut self) {
        self.saved_cursor = Some((self.row, self.col));
    }

    pub fn restore_cursor(&mut self) {
        if let Some((row, col)) = self.saved_cursor {
            self.row = row;
            self.col = col;
            self.ensure_row();
        }
    }

    /// Erase display. Mode 0 clears from the cursor to the end of the
    /// screen, mode 1 from the start of the screen through the cursor
    /// column, mode 2/3 the whole screen. The cursor does not move.
    pub fn erase_display(&mut self, mode: usize) {
        self.ensure_row();
        match mode {
            0 => {
                self.lines[self.row].truncate(self.col);
                self.lines.truncate(self.row + 1);
            }
            1 => {
                for line in self.lines.iter_mut().take(self.row) {
                    line.clear();
                }
                self.fill_line_through_col();
            }
            2 | 3 => {
                for line in self.lines.iter_mut() {
                    line.clear();
                }
            }
            _ => {}
        }
    }

    /// Erase line. Mode 0 truncates at the cursor, mode 1 blanks columns
    /// up to and including the cursor (keeping the tail so later writes
    /// land on their original columns), mode 2 empties the line.
    pub fn erase_line(&mut self, mode: usize) {
        self.ensure_row();
        match mode {
            0 => self.lines[self.row].truncate(self.col),
            1 => self.fill_line_through_col(),
            2 => self.lines[self.row].clear(),
            _ => {}
        }
    }

    fn fill_line_through_col(&mut self) {
        let line = &mut self.lines[self.row];
        while line.len() <= self.col {
            line.push(' ');
        }
        for cell in line.iter_mut().take(self.col + 1) {
            *cell = ' ';
        }
    }

    /// The visible screen as text: trailing spaces trimmed per line,
    /// trailing empty lines dropped, lines joined with `\n`.
    pub fn snapshot(&self) -> String {
        let mut rendered: Vec<String> = self
            .lines
            .iter()
            .map(|line| {
                let text: String = line.iter().collect();
                text.trim_end_matches(' ').to_string()
            })
            .collect();
        while rendered.last().map(|line| line.is_empty()).unwrap_or(false) {
            rendered.pop();
        }
        rendered.join("\n")
    }
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}
