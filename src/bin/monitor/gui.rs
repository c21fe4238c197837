use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::warn;
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    symbols,
    text::Span,
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame, Terminal,
};
use std::{
    io::{self, Stdout},
    path::PathBuf,
    time::{Duration, Instant},
};

use echofleet::grid::GridSnapshot;

/// Raw mode and the alternate screen, for as long as this lives.
struct TerminalGuard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        Ok(Self { terminal })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        // nothing useful to do if the terminal will not come back
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}

/// Cells of the last map that could be read, split by what they hold.
struct MapView {
    path: PathBuf,
    free: Vec<(f64, f64)>,
    occupied: Vec<(f64, f64)>,
    uncertain: Vec<(f64, f64)>,
    x_bounds: [f64; 2],
    y_bounds: [f64; 2],
    status: String,
}

impl MapView {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            free: vec![],
            occupied: vec![],
            uncertain: vec![],
            x_bounds: [-1.0, 1.0],
            y_bounds: [-1.0, 1.0],
            status: "waiting for a map".to_string(),
        }
    }

    /// Rereads the map file. On failure the previous map stays up and the
    /// error goes into the status line.
    fn reload(&mut self) {
        match GridSnapshot::from_path(&self.path) {
            Ok(snapshot) => self.show(&snapshot),
            Err(error) => {
                warn!("could not read {}: {}", self.path.display(), error);
                self.status = format!("read failed: {}", error);
            }
        }
    }

    fn show(&mut self, snapshot: &GridSnapshot) {
        self.free.clear();
        self.occupied.clear();
        self.uncertain.clear();
        for (cell, value) in &snapshot.cells {
            let point = (cell.x as f64, cell.y as f64);
            if value.abs() < snapshot.occupied_threshold {
                self.uncertain.push(point);
            } else if *value > 0.0 {
                self.occupied.push(point);
            } else {
                self.free.push(point);
            }
        }
        let (lo, hi) = snapshot.bounds();
        self.x_bounds = [lo.x as f64 - 1.0, hi.x as f64 + 1.0];
        self.y_bounds = [lo.y as f64 - 1.0, hi.y as f64 + 1.0];
        self.status = format!(
            "{} cells of {} cm: {} free, {} occupied, {} uncertain",
            snapshot.cells.len(),
            snapshot.cell_cm,
            self.free.len(),
            self.occupied.len(),
            self.uncertain.len()
        );
    }
}

/// Shows the map at `path` until `q` or Esc, rereading it every `tick`.
/// `r` rereads it at once.
pub fn watch(path: PathBuf, tick: Duration) -> io::Result<()> {
    let mut guard = TerminalGuard::enter()?;
    let mut view = MapView::new(path);
    view.reload();
    watch_loop(&mut guard.terminal, &mut view, tick)
}

fn watch_loop<B: Backend>(
    terminal: &mut Terminal<B>,
    view: &mut MapView,
    tick: Duration,
) -> io::Result<()> {
    let mut next_reload = Instant::now() + tick;
    loop {
        terminal.draw(|f| draw(f, view))?;

        let wait = next_reload.saturating_duration_since(Instant::now());
        if event::poll(wait)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                    KeyCode::Char('r') => next_reload = Instant::now(),
                    _ => {}
                }
            }
        }
        if Instant::now() >= next_reload {
            view.reload();
            next_reload = Instant::now() + tick;
        }
    }
}

fn labels(bounds: [f64; 2]) -> Vec<Span<'static>> {
    let mid = (bounds[0] + bounds[1]) / 2.0;
    [bounds[0], mid, bounds[1]]
        .iter()
        .map(|v| Span::from(format!("{:.0}", v)))
        .collect()
}

fn scatter<'a>(
    name: &'a str,
    marker: symbols::Marker,
    color: Color,
    data: &'a [(f64, f64)],
) -> Dataset<'a> {
    Dataset::default()
        .name(name)
        .marker(marker)
        .graph_type(GraphType::Scatter)
        .style(Style::default().fg(color))
        .data(data)
}

fn draw(f: &mut Frame, view: &MapView) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(1)])
        .split(f.size());

    let chart = Chart::new(vec![
        scatter("free", symbols::Marker::Dot, Color::Green, &view.free),
        scatter("occupied", symbols::Marker::Block, Color::Red, &view.occupied),
        scatter("uncertain", symbols::Marker::Dot, Color::DarkGray, &view.uncertain),
    ])
    .block(
        Block::default()
            .title(format!("{} (q quits, r reloads)", view.path.display()))
            .borders(Borders::ALL),
    )
    .x_axis(
        Axis::default()
            .title("x (cells)")
            .bounds(view.x_bounds)
            .labels(labels(view.x_bounds)),
    )
    .y_axis(
        Axis::default()
            .title("y (cells)")
            .bounds(view.y_bounds)
            .labels(labels(view.y_bounds)),
    );

    f.render_widget(chart, rows[0]);
    f.render_widget(Paragraph::new(view.status.as_str()), rows[1]);
}
