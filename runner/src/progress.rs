use std::io::{self, Write};

pub const BAR_LENGTH: usize = 40;

/// Render one frame of a terminal progress bar, the last frame ends the line
pub fn render_progress(
    iteration: usize,
    total: usize,
    prefix: &str,
    suffix: &str,
    decimals: usize,
    bar_length: usize,
) -> String {
    let fraction = if total == 0 {
        1.0
    } else {
        iteration as f64 / total as f64
    };
    let filled = ((bar_length as f64 * fraction).round() as usize).min(bar_length);

    let mut frame = format!(
        "\r{prefix} |{}{}| {:.decimals$}% {suffix}",
        "█".repeat(filled),
        "-".repeat(bar_length - filled),
        100.0 * fraction,
    );

    if total == 0 || iteration >= total {
        frame.push('\n');
    }

    frame
}

/// Draw the progress bar on `out`
pub fn print_progress<W: Write>(
    out: &mut W,
    iteration: usize,
    total: usize,
    prefix: &str,
) -> io::Result<()> {
    out.write_all(render_progress(iteration, total, prefix, "", 1, BAR_LENGTH).as_bytes())?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bar() {
        assert_eq!(
            render_progress(0, 4, "Progress:", "", 1, 8),
            "\rProgress: |--------| 0.0% "
        );
    }

    #[test]
    fn partial_bar_rounds() {
        assert_eq!(
            render_progress(1, 3, "Progress:", "files", 1, 10),
            "\rProgress: |███-------| 33.3% files"
        );
    }

    #[test]
    fn completion_ends_the_line() {
        assert_eq!(
            render_progress(4, 4, "P", "", 0, 4),
            "\rP |████| 100% \n"
        );
    }

    #[test]
    fn bar_is_drawn_on_the_writer() {
        let mut out = Vec::new();
        print_progress(&mut out, 0, 2, "Inspecting files").unwrap();
        print_progress(&mut out, 2, 2, "Inspecting files").unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("\rInspecting files |"));
        assert!(out.ends_with("| 100.0% \n"));
    }

    #[test]
    fn zero_total_is_complete() {
        assert_eq!(render_progress(0, 0, "P", "", 1, 2), "\rP |██| 100.0% \n");
    }
}
