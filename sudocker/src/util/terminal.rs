//! Terminal size lookup for sizing an attached TTY (`-t`).

/// Returns `(cols, rows)`, falling back to 80x24 when the output is not a
/// terminal (e.g. piped/redirected, or when run under a test harness).
pub fn terminal_size() -> (u16, u16) {
    term_size::dimensions()
        .map(|(w, h)| (w as u16, h as u16))
        .unwrap_or((80, 24))
}
