//! Interactive format selector.
//!
//! A cooperative, single-threaded chooser over the extractor's format
//! table: raw mode, arrow/jk navigation, enter selects, q or escape
//! cancels. Pure terminal rendering; no network, no background tasks.

use std::io::{Write, stdout};
use std::time::Duration;

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    style::Print,
    terminal::{self, Clear, ClearType},
};
use ytgrab_engine::Format;

use crate::render::format_bytes;

/// One row of the selector/`--list-formats` table.
pub fn format_row(format: &Format) -> String {
    let quality = match (&format.resolution, format.audio_bitrate) {
        (Some(res), _) => format!("{}x{}", res.width, res.height),
        (None, Some(abr)) => format!("{abr} kbps"),
        (None, None) => "-".to_string(),
    };
    let size = format
        .approx_size
        .map(format_bytes)
        .unwrap_or_else(|| "?".to_string());
    format!(
        "{:<8} {:<6} {:<12} {:<10} {:>10}",
        format.itag, format.container, format.codec, quality, size
    )
}

pub fn table_header() -> String {
    format!(
        "{:<8} {:<6} {:<12} {:<10} {:>10}",
        "itag", "ext", "codec", "quality", "size"
    )
}

fn draw(rows: &[String], cursor_at: usize, first_draw: bool) -> std::io::Result<()> {
    let mut out = stdout();
    if !first_draw {
        // Repaint in place: header + rows.
        execute!(out, cursor::MoveUp(rows.len() as u16 + 1))?;
    }
    execute!(
        out,
        Clear(ClearType::CurrentLine),
        Print(format!("  {}\r\n", table_header()))
    )?;
    for (i, row) in rows.iter().enumerate() {
        let marker = if i == cursor_at { '>' } else { ' ' };
        execute!(
            out,
            Clear(ClearType::CurrentLine),
            Print(format!("{marker} {row}\r\n"))
        )?;
    }
    out.flush()
}

/// Run the chooser; `None` means the operator cancelled.
///
/// Blocking by design: call before the job is submitted, never from a
/// worker. The terminal is restored on every exit path.
pub fn choose_format(formats: &[Format]) -> std::io::Result<Option<Format>> {
    if formats.is_empty() {
        return Ok(None);
    }

    let rows: Vec<String> = formats.iter().map(format_row).collect();
    let mut cursor_at = 0usize;

    terminal::enable_raw_mode()?;
    let result = (|| -> std::io::Result<Option<Format>> {
        draw(&rows, cursor_at, true)?;
        loop {
            if !event::poll(Duration::from_millis(100))? {
                continue;
            }
            let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
                continue;
            };
            if kind != KeyEventKind::Press {
                continue;
            }
            match code {
                KeyCode::Up | KeyCode::Char('k') => {
                    cursor_at = cursor_at.saturating_sub(1);
                    draw(&rows, cursor_at, false)?;
                }
                KeyCode::Down | KeyCode::Char('j') => {
                    cursor_at = (cursor_at + 1).min(rows.len() - 1);
                    draw(&rows, cursor_at, false)?;
                }
                KeyCode::Enter => return Ok(Some(formats[cursor_at].clone())),
                KeyCode::Esc | KeyCode::Char('q') => return Ok(None),
                _ => {}
            }
        }
    })();
    terminal::disable_raw_mode()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ytgrab_engine::{FormatKind, FormatSource, Resolution};

    fn format(itag: &str, height: Option<u32>, abr: Option<u32>) -> Format {
        Format {
            itag: itag.to_string(),
            container: "mp4".to_string(),
            codec: "avc1".to_string(),
            kind: FormatKind::Progressive,
            bitrate: None,
            resolution: height.map(|h| Resolution::new(h * 16 / 9, h)),
            audio_bitrate: abr,
            approx_size: Some(10 * 1024 * 1024),
            source: FormatSource::Url {
                url: "https://cdn.example/x".to_string(),
                size: None,
            },
        }
    }

    #[test]
    fn rows_show_resolution_for_video_and_bitrate_for_audio() {
        let row = format_row(&format("22", Some(720), None));
        assert!(row.contains("1280x720"));
        assert!(row.contains("10.0 MiB"));

        let row = format_row(&format("140", None, Some(128)));
        assert!(row.contains("128 kbps"));
    }

    #[test]
    fn header_and_rows_align_on_the_same_columns() {
        let header = table_header();
        let row = format_row(&format("22", Some(720), None));
        assert_eq!(
            header.find("ext"),
            row.find("mp4"),
            "container column must line up"
        );
    }
}
