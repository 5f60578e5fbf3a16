use std::path::Path;

use verabot_db::MigrationStatus;

/// Render the `verabot status` box: one row per known migration.
pub fn render_status(statuses: &[MigrationStatus], db_path: &Path) -> String {
    let version = env!("CARGO_PKG_VERSION");
    let current = statuses
        .iter()
        .filter(|s| s.is_applied())
        .map(|s| s.version)
        .max()
        .unwrap_or(0);
    let pending = statuses.iter().filter(|s| !s.is_applied()).count();

    let db_display = match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => db_path.to_string_lossy().replace(&home, "~"),
        _ => db_path.to_string_lossy().to_string(),
    };

    // Layout
    let width: usize = 72;
    let inner = width - 4; // "│ " + " │"

    let title = format!("VeraBot v{version}");
    let title_dashes = width.saturating_sub(title.len() + 7); // "╭─── " + " " + "╮"
    let top = format!("╭─── {title} {}╮", "─".repeat(title_dashes));
    let rule = format!("├{}┤", "─".repeat(width - 2));
    let bottom = format!("╰{}╯", "─".repeat(width - 2));

    let row = |text: &str| format!("│ {:<inner$} │", truncate(text, inner));

    let summary = match pending {
        0 => format!("schema at version {current}, up to date"),
        n => format!("schema at version {current}, {n} pending"),
    };

    let mut lines = vec![
        top,
        row(&format!("Database  {db_display}")),
        row(&summary),
        rule,
    ];
    for status in statuses {
        let applied = match status.applied_at {
            Some(at) => at.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "pending".to_string(),
        };
        let line = format!(
            "{:>3}  {:<19}  {}",
            status.version, applied, status.description
        );
        lines.push(row(&line));
    }
    lines.push(bottom);

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
