use super::screen::Screen;

const ESC: char = '\u{1b}';

/// Parser state carried across `write` calls, so escape sequences split
/// over chunk boundaries parse exactly like the concatenated stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    Ground,
    Escape,
    Csi { private: bool, params: String },
}

/// Incremental projection of a terminal output stream onto a [`Screen`].
///
/// Feeds arbitrary chunk boundaries through a small CSI state machine:
/// cursor motion and erase sequences are applied, SGR and private-mode
/// sequences are dropped, everything else prints.
#[derive(Debug, Clone)]
pub struct TerminalProjector {
    screen: Screen,
    state: ParseState,
}

impl TerminalProjector {
    pub fn new() -> Self {
        Self {
            screen: Screen::new(),
            state: ParseState::Ground,
        }
    }

    pub fn write(&mut self, chunk: &str) {
        for ch in chunk.chars() {
            self.advance(ch);
        }
    }

    pub fn snapshot(&self) -> String {
        self.screen.snapshot()
    }

    pub fn clear(&mut self) {
        self.screen.reset();
        self.state = ParseState::Ground;
    }

    fn advance(&mut self, ch: char) {
        match std::mem::replace(&mut self.state, ParseState::Ground) {
            ParseState::Ground => self.advance_ground(ch),
            ParseState::Escape => {
                if ch == '[' {
                    self.state = ParseState::Csi {
                        private: false,
                        params: String::new(),
                    };
                }
                // Any other introducer is a sequence we do not project;
                // swallow the one character and resume.
            }
            ParseState::Csi { private, mut params } => {
                if params.is_empty() && !private && ch == '?' {
                    self.state = ParseState::Csi {
                        private: true,
                        params,
                    };
                } else if ch.is_ascii_digit() || ch == ';' {
                    params.push(ch);
                    self.state = ParseState::Csi { private, params };
                } else if !private {
                    self.dispatch_csi(&params, ch);
                }
                // A private-mode final byte ends the sequence with no effect.
            }
        }
    }

    fn advance_ground(&mut self, ch: char) {
        match ch {
            ESC => self.state = ParseState::Escape,
            '\r' => self.screen.carriage_return(),
            '\n' => self.screen.line_feed(),
            '\u{8}' => self.screen.backspace(),
            '\t' => self.screen.tab(),
            ch if (ch as u32) >= 32 => self.screen.put_char(ch),
            _ => {}
        }
    }

    fn dispatch_csi(&mut self, raw_params: &str, command: char) {
        let params: Vec<usize> = if raw_params.is_empty() {
            Vec::new()
        } else {
            raw_params
                .split(';')
                .map(|part| part.parse::<usize>().unwrap_or(0))
                .collect()
        };
        let n = params.first().copied().unwrap_or(1).max(1);

        match command {
            'A' => self.screen.cursor_up(n),
            'B' => self.screen.cursor_down(n),
            'C' => self.screen.cursor_forward(n),
            'D' => self.screen.cursor_back(n),
            'E' => self.screen.next_line(n),
            'F' => self.screen.prev_line(n),
            'G' => self.screen.set_col(n),
            'H' | 'f' => {
                let row = params.first().copied().unwrap_or(1).max(1);
                let col = params.get(1).copied().unwrap_or(1).max(1);
                self.screen.set_position(row, col);
            }
            'J' => self.screen.erase_display(params.first().copied().unwrap_or(0)),
            'K' => self.screen.erase_line(params.first().copied().unwrap_or(0)),
            's' => self.screen.save_cursor(),
            'u' => self.screen.restore_cursor(),
            // SGR carries no information in a plain-text projection.
            'm' => {}
            _ => {}
        }
    }
}

impl Default for TerminalProjector {
    fn default() -> Self {
        Self::new()
    }
}
