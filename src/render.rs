use colored::Colorize;
use crossterm::terminal::size as terminal_size;
use num_format::{Locale, ToFormattedString};

use crate::chart::{BarSpec, PieSpec};

const BAR_GLYPH: &str = "█";

/// Palette used to give every model a stable color.
const MODEL_PALETTE: [(u8, u8, u8); 12] = [
    (0x1f, 0x77, 0xb4),
    (0xff, 0x7f, 0x0e),
    (0x2c, 0xa0, 0x2c),
    (0xd6, 0x27, 0x28),
    (0x94, 0x67, 0xbd),
    (0x8c, 0x56, 0x4b),
    (0xe3, 0x77, 0xc2),
    (0x17, 0xbe, 0xcf),
    (0xbc, 0xbd, 0x22),
    (0x6b, 0x8e, 0x23),
    (0x46, 0x82, 0xb4),
    (0xda, 0xa5, 0x20),
];

/// How raw quota is shown: converted to currency, or as a plain number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaDisplay {
    pub quota_per_unit: f64,
    pub in_currency: bool,
}

impl QuotaDisplay {
    pub fn render_quota(&self, quota: f64, digits: usize) -> String {
        if self.in_currency {
            format!("${:.digits$}", quota / self.quota_per_unit)
        } else {
            render_number(quota.max(0.0).round() as u64)
        }
    }

    /// Formats an already converted usage amount.
    pub fn render_usage(&self, usage: f64, digits: usize) -> String {
        if self.in_currency {
            format!("${usage:.digits$}")
        } else {
            format!("{usage:.digits$}")
        }
    }
}

/// Compact count: 12.3k, 4.5M, 1.2B.
pub fn render_number(value: u64) -> String {
    if value >= 1_000_000_000 {
        format!("{:.1}B", value as f64 / 1_000_000_000.0)
    } else if value >= 1_000_000 {
        format!("{:.1}M", value as f64 / 1_000_000.0)
    } else if value >= 10_000 {
        format!("{:.1}k", value as f64 / 1_000.0)
    } else {
        value.to_string()
    }
}

pub fn format_count(value: u64, locale: &Locale) -> String {
    value.to_formatted_string(locale)
}

pub fn model_color(model: &str) -> (u8, u8, u8) {
    // FNV-1a keeps colors stable across runs and platforms
    let mut hash: u32 = 0x811c_9dc5;
    for byte in model.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    MODEL_PALETTE[hash as usize % MODEL_PALETTE.len()]
}

/// Splits `width` cells among segments in proportion to their values.
pub fn segment_widths(values: &[f64], scale_max: f64, width: usize) -> Vec<usize> {
    if scale_max <= 0.0 || width == 0 {
        return vec![0; values.len()];
    }
    let mut cumulative = 0.0;
    let mut drawn = 0usize;
    values
        .iter()
        .map(|value| {
            cumulative += value.max(0.0);
            let end = ((cumulative / scale_max) * width as f64).round() as usize;
            let end = end.min(width);
            let cells = end.saturating_sub(drawn);
            drawn = drawn.max(end);
            cells
        })
        .collect()
}

pub fn resolve_locale(raw: Option<&str>) -> Locale {
    match raw {
        Some("en") | Some("en-US") | Some("en-GB") | None => Locale::en,
        Some("fr") | Some("fr-FR") => Locale::fr,
        Some("de") | Some("de-DE") => Locale::de,
        Some("es") | Some("es-ES") => Locale::es,
        Some("it") | Some("it-IT") => Locale::it,
        Some("ja") | Some("ja-JP") => Locale::ja,
        _ => Locale::en,
    }
}

pub fn locale_to_string(locale: &Locale) -> String {
    match locale {
        Locale::fr => "fr",
        Locale::de => "de",
        Locale::es => "es",
        Locale::it => "it",
        Locale::ja => "ja",
        _ => "en",
    }
    .to_string()
}

pub fn print_bar_chart(spec: &BarSpec, display: &QuotaDisplay) {
    println!(
        "{} {}",
        spec.title.bold(),
        format!("({})", spec.subtitle).dimmed()
    );
    let stacks = spec.stacks();
    if stacks.is_empty() {
        println!("No usage to chart");
        return;
    }

    let label_width = stacks.iter().map(|s| s.label.chars().count()).max().unwrap_or(0);
    let total_texts: Vec<String> = stacks.iter().map(|s| display.render_usage(s.total, 4)).collect();
    let total_width = total_texts.iter().map(|t| t.chars().count()).max().unwrap_or(0);
    let bar_width = (get_terminal_width() as usize)
        .saturating_sub(label_width + total_width + 6)
        .clamp(10, 60);
    let scale_max = stacks.iter().map(|s| s.total).fold(0.0, f64::max);

    for (stack, total) in stacks.iter().zip(&total_texts) {
        let values: Vec<f64> = stack.segments.iter().map(|(_, v)| *v).collect();
        let widths = segment_widths(&values, scale_max, bar_width);
        let mut bar = String::new();
        for ((model, _), cells) in stack.segments.iter().zip(widths) {
            let (r, g, b) = model_color(model);
            bar.push_str(&BAR_GLYPH.repeat(cells).truecolor(r, g, b).to_string());
        }
        let pad = bar_width.saturating_sub(strip_ansi(&bar).chars().count());
        println!(
            "{:label_width$} │ {}{} {:>total_width$}",
            stack.label,
            bar,
            " ".repeat(pad),
            total
        );
    }

    let legend: Vec<String> = spec
        .models()
        .into_iter()
        .map(|model| {
            let (r, g, b) = model_color(model);
            format!("{} {}", BAR_GLYPH.truecolor(r, g, b), model)
        })
        .collect();
    println!("{}", legend.join("  "));

    println!();
    let mut table = SimpleTable::new(vec!["Time", "Model", "Usage"]).header_style(|s| s.cyan().bold());
    for stack in &stacks {
        // Tooltip order: largest segment first
        let mut segments = stack.segments.clone();
        segments.sort_by(|a, b| b.1.total_cmp(&a.1));
        for (model, usage) in segments {
            table.add_row(vec![
                stack.label.to_string(),
                model.to_string(),
                display.render_usage(usage, 4),
            ]);
        }
    }
    let grand_total: f64 = stacks.iter().map(|s| s.total).sum();
    table.set_footer(vec![
        "Total".yellow().bold().to_string(),
        String::new(),
        display.render_usage(grand_total, 4).yellow().to_string(),
    ]);
    table.print();
}

pub fn print_pie_chart(spec: &PieSpec, locale: &Locale) {
    println!(
        "{} {}",
        spec.title.bold(),
        format!("({})", spec.subtitle).dimmed()
    );
    let mut table =
        SimpleTable::new(vec!["Model", "Calls", "Share", ""]).header_style(|s| s.cyan().bold());
    for share in &spec.values {
        let percent = spec.percent(share.value);
        let (r, g, b) = model_color(&share.model);
        let cells = (percent / 100.0 * 30.0).round() as usize;
        table.add_row(vec![
            share.model.clone(),
            format_count(share.value, locale),
            format!("{percent:.1}%"),
            BAR_GLYPH.repeat(cells).truecolor(r, g, b).to_string(),
        ]);
    }
    table.set_footer(vec![
        "Total".yellow().bold().to_string(),
        format_count(spec.total(), locale).yellow().to_string(),
        String::new(),
        String::new(),
    ]);
    table.print();
}

/// Get terminal width, defaulting to 120 if unavailable
pub fn get_terminal_width() -> u16 {
    terminal_size().map(|(w, _)| w).unwrap_or(120)
}

/// Simple table with box-drawing characters
pub struct SimpleTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    header_style: Option<fn(&str) -> colored::ColoredString>,
    footer: Option<Vec<String>>,
}

impl SimpleTable {
    pub fn new(headers: Vec<&str>) -> Self {
        Self {
            headers: headers.into_iter().map(String::from).collect(),
            rows: Vec::new(),
            header_style: None,
            footer: None,
        }
    }

    pub fn header_style(mut self, f: fn(&str) -> colored::ColoredString) -> Self {
        self.header_style = Some(f);
        self
    }

    pub fn add_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn set_footer(&mut self, footer: Vec<String>) {
        self.footer = Some(footer);
    }

    fn widths(&self) -> Vec<usize> {
        let num_cols = self.headers.len();
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in self.rows.iter().chain(self.footer.iter()) {
            for (i, cell) in row.iter().enumerate().take(num_cols) {
                widths[i] = widths[i].max(strip_ansi(cell).chars().count());
            }
        }
        widths
    }

    pub fn print(&self) {
        let widths = self.widths();

        println!("{}", border('┌', '┬', '┐', &widths));
        let header: Vec<String> = self
            .headers
            .iter()
            .zip(&widths)
            .map(|(h, &w)| {
                let padded = format!("{h:w$}");
                match self.header_style {
                    Some(style) => style(&padded).to_string(),
                    None => padded,
                }
            })
            .collect();
        println!("│ {} │", header.join(" │ "));
        println!("{}", border('├', '┼', '┤', &widths));

        for row in &self.rows {
            println!("{}", row_line(row, &widths));
        }

        if let Some(ref footer) = self.footer {
            println!("{}", border('├', '┼', '┤', &widths));
            println!("{}", row_line(footer, &widths));
        }

        println!("{}", border('└', '┴', '┘', &widths));
    }
}

fn border(left: char, mid: char, right: char, widths: &[usize]) -> String {
    let parts: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
    format!("{left}{}{right}", parts.join(&mid.to_string()))
}

fn row_line(row: &[String], widths: &[usize]) -> String {
    let cells: Vec<String> = widths
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            let pad = w.saturating_sub(strip_ansi(cell).chars().count());
            format!("{cell}{}", " ".repeat(pad))
        })
        .collect();
    format!("│ {} │", cells.join(" │ "))
}

pub fn strip_ansi(s: &str) -> String {
    let mut result = String::new();
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' {
            in_escape = true;
        } else if in_escape {
            if c == 'm' {
                in_escape = false;
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_numbers() {
        assert_eq!(render_number(9_999), "9999");
        assert_eq!(render_number(12_345), "12.3k");
        assert_eq!(render_number(4_500_000), "4.5M");
        assert_eq!(render_number(1_200_000_000), "1.2B");
    }

    #[test]
    fn quota_in_currency_or_raw() {
        let currency = QuotaDisplay {
            quota_per_unit: 500_000.0,
            in_currency: true,
        };
        assert_eq!(currency.render_quota(900_000.0, 2), "$1.80");
        assert_eq!(currency.render_usage(0.004, 4), "$0.0040");
        let raw = QuotaDisplay {
            in_currency: false,
            ..currency
        };
        assert_eq!(raw.render_quota(900_000.0, 2), "900.0k");
    }

    #[test]
    fn model_colors_are_stable() {
        assert_eq!(model_color("gpt-4o"), model_color("gpt-4o"));
        assert!(MODEL_PALETTE.contains(&model_color("")));
    }

    #[test]
    fn segments_fill_to_scale() {
        assert_eq!(segment_widths(&[1.0, 1.0], 2.0, 10), vec![5, 5]);
        assert_eq!(segment_widths(&[1.0], 4.0, 10), vec![3]);
        assert_eq!(segment_widths(&[0.0, 3.0], 3.0, 9), vec![0, 9]);
        assert_eq!(segment_widths(&[1.0], 0.0, 9), vec![0]);
    }

    #[test]
    fn strips_color_codes() {
        let colored = "abc".red().to_string();
        assert_eq!(strip_ansi(&colored), "abc");
    }
}
