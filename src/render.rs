//! Plain-text table rendering for `preview`.

use std::fmt::Write as _;

use itertools::Itertools;

use crate::table::Table;

/// Default cap on a rendered cell, in terminal columns.
pub const DEFAULT_CELL_WIDTH: usize = 40;

/// Renders up to `limit` rows of `table` as aligned columns.
pub fn render_table(table: &Table, limit: usize, max_cell_width: usize) -> String {
    let headers = table.columns.names().to_vec();
    let rows = (0..table.len().min(limit))
        .map(|idx| table.record(idx))
        .collect::<Vec<_>>();
    render_rows(&headers, &rows, max_cell_width)
}

pub fn render_rows(headers: &[String], rows: &[Vec<String>], max_cell_width: usize) -> String {
    let max_cell_width = max_cell_width.max(4);
    let clip = |value: &str| truncate(&flatten(value), max_cell_width);
    let headers = headers.iter().map(|h| clip(h)).collect::<Vec<_>>();
    let rows = rows
        .iter()
        .map(|row| row.iter().map(|cell| clip(cell)).collect::<Vec<_>>())
        .collect::<Vec<_>>();

    let mut widths = headers
        .iter()
        .map(|h| display_width(h).max(3))
        .collect::<Vec<_>>();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(display_width(cell));
        }
    }

    let mut output = String::new();
    let _ = writeln!(output, "{}", format_row(&headers, &widths));
    let rule = widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>();
    let _ = writeln!(output, "{}", format_row(&rule, &widths));
    for row in &rows {
        let _ = writeln!(output, "{}", format_row(row, &widths));
    }
    output
}

fn format_row(values: &[String], widths: &[usize]) -> String {
    let line = values
        .iter()
        .zip(widths)
        .map(|(value, width)| {
            let padding = width.saturating_sub(display_width(value));
            format!("{value}{}", " ".repeat(padding))
        })
        .join("  ");
    line.trim_end().to_string()
}

fn flatten(value: &str) -> String {
    value
        .chars()
        .map(|ch| if matches!(ch, '\n' | '\r' | '\t') { ' ' } else { ch })
        .collect()
}

fn truncate(value: &str, max_width: usize) -> String {
    if display_width(value) <= max_width {
        return value.to_string();
    }
    let mut out = String::new();
    let mut width = 0;
    for ch in value.chars() {
        let w = char_width(ch);
        if width + w > max_width - 1 {
            break;
        }
        out.push(ch);
        width += w;
    }
    out.push('…');
    out
}

/// Terminal columns taken by `ch`: zero for combining marks and joiners, two
/// for East Asian wide forms and emoji, one otherwise.
fn char_width(ch: char) -> usize {
    match ch as u32 {
        0x0300..=0x036F | 0x200B..=0x200F | 0x20D0..=0x20FF | 0xFE00..=0xFE0F => 0,
        0x1100..=0x115F
        | 0x231A..=0x231B
        | 0x2329..=0x232A
        | 0x23E9..=0x23EC
        | 0x2614..=0x2615
        | 0x2648..=0x2653
        | 0x26AA..=0x26AB
        | 0x26BD..=0x26BE
        | 0x2705
        | 0x270A..=0x270B
        | 0x2728
        | 0x274C
        | 0x2753..=0x2755
        | 0x2795..=0x2797
        | 0x2B1B..=0x2B1C
        | 0x2E80..=0x303E
        | 0x3041..=0x33FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xA000..=0xA4CF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFE10..=0xFE19
        | 0xFE30..=0xFE6F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6
        | 0x1F004
        | 0x1F0CF
        | 0x1F18E
        | 0x1F191..=0x1F19A
        | 0x1F200..=0x1F251
        | 0x1F300..=0x1F64F
        | 0x1F680..=0x1F6FF
        | 0x1F900..=0x1F9FF
        | 0x1FA70..=0x1FAFF
        | 0x20000..=0x2FFFD
        | 0x30000..=0x3FFFD => 2,
        _ => 1,
    }
}

fn display_width(value: &str) -> usize {
    value.chars().map(char_width).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_wide_characters() {
        let headers = vec!["Japanese".to_string(), "English".to_string()];
        let rows = vec![vec!["こんにちは".to_string(), "Hello".to_string()]];
        let rendered = render_rows(&headers, &rows, 40);
        let lines = rendered.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "Japanese    English");
        assert_eq!(lines[1], "----------  -------");
        assert_eq!(lines[2], "こんにちは  Hello");
    }

    #[test]
    fn long_cells_are_truncated() {
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(flatten("a\nb"), "a b");
    }

    #[test]
    fn emoji_and_combining_marks_are_measured() {
        assert_eq!(display_width("😀"), 2);
        assert_eq!(display_width("𠮷"), 2);
        assert_eq!(display_width("e\u{301}"), 1);
        assert_eq!(display_width("ｱｲ"), 2);
        assert_eq!(truncate("🎮🎮🎮", 5), "🎮🎮…");
    }
}
