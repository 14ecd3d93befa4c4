use crate::app::{App, Tab};
use crate::report::{AnalysisReport, percent};
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Bar, BarChart, BarGroup, Block, Borders, Cell, Chart, Dataset, GraphType, Paragraph, Row, Table, Tabs},
};

const SERIES_COLORS: [Color; 8] = [
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::LightRed,
    Color::LightGreen,
    Color::LightCyan,
    Color::LightMagenta,
];

pub fn render(f: &mut Frame, app: &App) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(2),
        ])
        .split(f.area());

    render_header(f, app, layout[0]);

    match app.tab {
        Tab::Frontier => render_frontier(f, &app.report, layout[1]),
        Tab::Allocation => render_allocation(f, &app.report, layout[1]),
        Tab::Assets => render_assets(f, &app.report, layout[1]),
    }

    render_footer(f, layout[2]);
}

fn render_header(f: &mut Frame, app: &App, area: Rect) {
    let titles: Vec<Line> = Tab::ALL
        .iter()
        .enumerate()
        .map(|(i, t)| Line::from(format!("{} {}", i + 1, t.title())))
        .collect();
    let opt = &app.report.optimal;
    let title = Line::from(vec![
        Span::styled(" Frontier TUI ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw("| "),
        Span::styled(
            format!(
                "Sharpe {:.3}  E[r] {:+.2}%  σ {:.2}% ",
                opt.sharpe_ratio,
                percent(opt.expected_return),
                percent(opt.volatility)
            ),
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
    ]);

    let tabs = Tabs::new(titles)
        .block(Block::default().borders(Borders::ALL).title(title))
        .select(app.tab.index())
        .style(Style::default().fg(Color::Gray))
        .highlight_style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));
    f.render_widget(tabs, area);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Controls: ", Style::default().fg(Color::Gray)),
        Span::styled("Tab/←/→ or 1-3: switch view | q/Esc: quit", Style::default().fg(Color::White)),
    ]));
    f.render_widget(footer, area);
}

/// `[lo, hi]` padded by 5% of the span, never degenerate.
fn padded_bounds(values: impl Iterator<Item = f64>) -> [f64; 2] {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() || !hi.is_finite() {
        return [0.0, 1.0];
    }
    let pad = ((hi - lo) * 0.05).max(1e-6);
    [lo - pad, hi + pad]
}

fn axis_labels(bounds: [f64; 2], suffix: &str) -> Vec<Span<'static>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::styled(format!("{:.1}{}", v, suffix), Style::default().fg(Color::Gray)))
        .collect()
}

fn render_frontier(f: &mut Frame, report: &AnalysisReport, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(75), Constraint::Percentage(25)])
        .split(area);

    let sample_points: Vec<(f64, f64)> = report
        .samples
        .samples
        .iter()
        .map(|s| (percent(s.volatility), percent(s.expected_return)))
        .collect();
    let frontier_points: Vec<(f64, f64)> = report
        .frontier
        .points
        .iter()
        .map(|p| (percent(p.volatility), percent(p.expected_return)))
        .collect();
    let optimal_point = [(percent(report.optimal.volatility), percent(report.optimal.expected_return))];
    let min_var_point: Vec<(f64, f64)> = report
        .min_variance
        .iter()
        .map(|mv| (percent(mv.volatility), percent(mv.expected_return)))
        .collect();

    let all = || {
        sample_points
            .iter()
            .chain(frontier_points.iter())
            .chain(optimal_point.iter())
            .chain(min_var_point.iter())
    };
    let x_bounds = padded_bounds(all().map(|p| p.0));
    let y_bounds = padded_bounds(all().map(|p| p.1));

    let mut datasets = vec![
        Dataset::default()
            .name("Samples")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::DarkGray))
            .data(&sample_points),
        Dataset::default()
            .name("Efficient frontier")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Cyan))
            .data(&frontier_points),
        Dataset::default()
            .name("Max Sharpe")
            .marker(symbols::Marker::Block)
            .graph_type(GraphType::Scatter)
            .style(Style::default().fg(Color::Red).add_modifier(Modifier::BOLD))
            .data(&optimal_point),
    ];
    if !min_var_point.is_empty() {
        datasets.push(
            Dataset::default()
                .name("Min variance")
                .marker(symbols::Marker::Block)
                .graph_type(GraphType::Scatter)
                .style(Style::default().fg(Color::Green).add_modifier(Modifier::BOLD))
                .data(&min_var_point),
        );
    }

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(Span::styled(
                    "Risk vs. Return (annualized)",
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL),
        )
        .x_axis(
            Axis::default()
                .title("Volatility")
                .style(Style::default().fg(Color::Gray))
                .bounds(x_bounds)
                .labels(axis_labels(x_bounds, "%")),
        )
        .y_axis(
            Axis::default()
                .title("Return")
                .style(Style::default().fg(Color::Gray))
                .bounds(y_bounds)
                .labels(axis_labels(y_bounds, "%")),
        );
    f.render_widget(chart, chunks[0]);

    let mut info = vec![
        Line::from(Span::styled("Max Sharpe", Style::default().fg(Color::Red).add_modifier(Modifier::BOLD))),
        Line::from(format!("Sharpe: {:.3}", report.optimal.sharpe_ratio)),
        Line::from(format!("Return: {:+.2}%", percent(report.optimal.expected_return))),
        Line::from(format!("Vol:    {:.2}%", percent(report.optimal.volatility))),
        Line::from(""),
    ];
    if let Some(mv) = &report.min_variance {
        info.push(Line::from(Span::styled(
            "Min Variance",
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        )));
        info.push(Line::from(format!("Return: {:+.2}%", percent(mv.expected_return))));
        info.push(Line::from(format!("Vol:    {:.2}%", percent(mv.volatility))));
        info.push(Line::from(""));
    }
    if let Some(best) = &report.best_sample {
        info.push(Line::from(Span::styled(
            "Best Sample",
            Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD),
        )));
        info.push(Line::from(format!("Sharpe: {:.3}", best.sharpe_ratio)));
        info.push(Line::from(""));
    }
    info.push(Line::from(format!("Samples:  {}", report.samples.len())));
    info.push(Line::from(format!("Frontier: {}", report.frontier.len())));
    if !report.frontier.skipped.is_empty() {
        info.push(Line::from(Span::styled(
            format!("Skipped:  {}", report.frontier.skipped.len()),
            Style::default().fg(Color::Yellow),
        )));
    }

    let panel = Paragraph::new(info)
        .block(Block::default().borders(Borders::ALL).title("Details"))
        .style(Style::default().fg(Color::White));
    f.render_widget(panel, chunks[1]);
}

fn render_allocation(f: &mut Frame, report: &AnalysisReport, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(area);

    let bars: Vec<Bar> = report
        .symbols
        .iter()
        .zip(report.optimal.weights.iter())
        .enumerate()
        .map(|(i, (symbol, w))| {
            let pct = percent(*w);
            Bar::default()
                .label(Line::from(symbol.clone()))
                .value((pct.max(0.0) * 100.0).round() as u64)
                .text_value(format!("{:.1}%", pct))
                .style(Style::default().fg(SERIES_COLORS[i % SERIES_COLORS.len()]))
        })
        .collect();

    let chart = BarChart::default()
        .block(Block::default().borders(Borders::ALL).title("Optimal Weights"))
        .bar_width(8)
        .bar_gap(2)
        .data(BarGroup::default().bars(&bars));
    f.render_widget(chart, chunks[0]);

    let header = Row::new(["Symbol", "Weight", "Ann.Ret", "Ann.Vol", "Sharpe"])
        .style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = report
        .analytics
        .summaries
        .iter()
        .zip(report.optimal.weights.iter())
        .map(|(a, w)| {
            Row::new(vec![
                Cell::from(a.symbol.clone()),
                Cell::from(format!("{:>7.2}%", percent(*w))),
                Cell::from(format!("{:>+7.2}%", percent(a.annual_return))),
                Cell::from(format!("{:>6.2}%", percent(a.annual_volatility))),
                Cell::from(a.sharpe_ratio.map(|s| format!("{:>6.2}", s)).unwrap_or_else(|| "n/a".to_string())),
            ])
        })
        .collect();
    let table = Table::new(rows, [Constraint::Length(8); 5])
        .header(header)
        .block(Block::default().borders(Borders::ALL).title("Assets"));
    f.render_widget(table, chunks[1]);
}

fn correlation_color(rho: f64) -> Color {
    if rho >= 0.7 {
        Color::Red
    } else if rho >= 0.3 {
        Color::LightRed
    } else if rho <= -0.3 {
        Color::LightBlue
    } else {
        Color::White
    }
}

fn render_assets(f: &mut Frame, report: &AnalysisReport, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    let mut header_cells = vec![Cell::from("")];
    header_cells.extend(report.symbols.iter().map(|s| Cell::from(s.clone())));
    let header = Row::new(header_cells).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = report
        .analytics
        .correlation
        .iter()
        .zip(report.symbols.iter())
        .map(|(row, symbol)| {
            let mut cells = vec![Cell::from(symbol.clone()).style(Style::default().fg(Color::Yellow))];
            cells.extend(
                row.iter()
                    .map(|rho| Cell::from(format!("{:>5.2}", rho)).style(Style::default().fg(correlation_color(*rho)))),
            );
            Row::new(cells)
        })
        .collect();
    let widths = vec![Constraint::Length(7); report.symbols.len() + 1];
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title("Correlation"));
    f.render_widget(table, chunks[0]);

    let growth = &report.analytics.cumulative;
    let series: Vec<Vec<(f64, f64)>> = growth
        .assets
        .iter()
        .map(|s| s.iter().enumerate().map(|(t, v)| (t as f64, *v)).collect())
        .collect();
    let optimal: Vec<(f64, f64)> = growth
        .optimal
        .iter()
        .flat_map(|s| s.iter().enumerate().map(|(t, v)| (t as f64, *v)))
        .collect();

    let mut datasets: Vec<Dataset> = series
        .iter()
        .zip(report.symbols.iter())
        .enumerate()
        .map(|(i, (points, symbol))| {
            Dataset::default()
                .name(symbol.clone())
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(SERIES_COLORS[i % SERIES_COLORS.len()]))
                .data(points)
        })
        .collect();
    if !optimal.is_empty() {
        datasets.push(
            Dataset::default()
                .name("Optimal")
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(Color::White).add_modifier(Modifier::BOLD))
                .data(&optimal),
        );
    }

    let x_max = growth.dates.len().saturating_sub(1).max(1) as f64;
    let y_bounds = padded_bounds(series.iter().flatten().chain(optimal.iter()).map(|p| p.1));
    let x_labels: Vec<Span> = [growth.dates.first(), growth.dates.last()]
        .iter()
        .map(|d| {
            Span::styled(
                d.map(|d| d.to_string()).unwrap_or_default(),
                Style::default().fg(Color::Gray),
            )
        })
        .collect();

    let chart = Chart::new(datasets)
        .block(Block::default().borders(Borders::ALL).title("Cumulative Growth of 1.0"))
        .x_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, x_max])
                .labels(x_labels),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::Gray))
                .bounds(y_bounds)
                .labels(axis_labels(y_bounds, "x")),
        );
    f.render_widget(chart, chunks[1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::run_analysis;
    use crate::config::AnalysisConfig;
    use crate::data::PriceSeries;
    use crossterm::event::KeyCode;
    use ratatui::{Terminal, backend::TestBackend};

    fn app() -> App {
        let symbols: Vec<String> = ["AAA", "BBB", "CCC"].iter().map(|s| s.to_string()).collect();
        let prices = PriceSeries::synthetic(&symbols, 120, 4).unwrap();
        let config = AnalysisConfig {
            num_portfolios: 300,
            frontier_points: 8,
            seed: Some(1),
            ..AnalysisConfig::default()
        };
        App::new(run_analysis(&config, &prices).unwrap())
    }

    #[test]
    fn test_every_tab_renders() {
        let mut app = app();
        let mut terminal = Terminal::new(TestBackend::new(120, 40)).unwrap();
        for _ in Tab::ALL {
            terminal.draw(|f| render(f, &app)).unwrap();
            app.handle_key(KeyCode::Tab);
        }
        assert_eq!(app.tab, Tab::Frontier);
    }

    #[test]
    fn test_key_navigation() {
        let mut app = app();
        app.handle_key(KeyCode::Char('3'));
        assert_eq!(app.tab, Tab::Assets);
        app.handle_key(KeyCode::Right);
        assert_eq!(app.tab, Tab::Frontier);
        app.handle_key(KeyCode::Left);
        assert_eq!(app.tab, Tab::Assets);
        assert!(!app.should_quit);
        app.handle_key(KeyCode::Char('q'));
        assert!(app.should_quit);
    }

    #[test]
    fn test_padded_bounds_never_degenerate() {
        let b = padded_bounds([2.0, 2.0].into_iter());
        assert!(b[0] < b[1]);
        assert_eq!(padded_bounds(std::iter::empty()), [0.0, 1.0]);
    }
}
