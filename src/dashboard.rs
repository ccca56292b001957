//! Interactive two-chart dashboard.
//!
//! Queries run on worker threads. Every query takes a sequence number from
//! [`RequestTracker`] and only the response to the newest query is allowed to
//! reach the charts; anything older is dropped when it arrives.

use std::{
    sync::{
        Arc,
        mpsc::{Receiver, Sender, channel},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use crossterm::{
    ExecutableCommand,
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use num_format::Locale;
use ratatui::{
    Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block as TuiBlock, Borders, Paragraph},
};

use crate::{
    aggregate::Aggregator,
    chart::{BarSpec, ChartSync, PieSpec},
    fetch::{DashboardUser, FetchError, UsageRecord, UsageSource},
    query::{Granularity, Preset, QueryFilter, build_request, format_datetime},
    render::{QuotaDisplay, format_count, model_color, segment_widths},
};

const BAR_GLYPH: &str = "█";
const PIE_BAR_CELLS: usize = 30;

pub struct DashboardContext {
    pub source: Arc<dyn UsageSource>,
    pub tz: Tz,
    pub locale: Locale,
    pub is_admin: bool,
    pub display: QuotaDisplay,
    pub filter: QueryFilter,
}

/// Hands out query sequence numbers and remembers which one is current.
#[derive(Debug, Default)]
pub struct RequestTracker {
    latest: u64,
    outstanding: Option<u64>,
}

impl RequestTracker {
    pub fn begin(&mut self) -> u64 {
        self.latest += 1;
        self.outstanding = Some(self.latest);
        self.latest
    }

    /// True when `seq` is the newest query; older sequence numbers are stale.
    pub fn complete(&mut self, seq: u64) -> bool {
        if seq != self.latest {
            return false;
        }
        self.outstanding = None;
        true
    }

    pub fn is_loading(&self) -> bool {
        self.outstanding.is_some()
    }
}

enum WorkerMessage {
    Usage {
        seq: u64,
        granularity: Granularity,
        result: Result<Vec<UsageRecord>, FetchError>,
    },
    Users(Result<Vec<DashboardUser>, FetchError>),
}

#[derive(Debug, Clone, PartialEq)]
enum Notice {
    Info(String),
    Error(String),
}

#[derive(Debug, PartialEq)]
enum Action {
    None,
    Query,
    Quit,
}

pub struct Dashboard {
    source: Arc<dyn UsageSource>,
    tz: Tz,
    locale: Locale,
    is_admin: bool,
    quota_per_unit: f64,
    display: QuotaDisplay,
    filter: QueryFilter,
    charts: ChartSync,
    tracker: RequestTracker,
    users: Vec<DashboardUser>,
    user_cursor: Option<usize>,
    search: Option<String>,
    directory_error: Option<String>,
    notice: Option<Notice>,
    mounted: bool,
    tx: Sender<WorkerMessage>,
    rx: Receiver<WorkerMessage>,
}

impl Dashboard {
    pub fn new(ctx: DashboardContext) -> Self {
        let (tx, rx) = channel();
        Dashboard {
            source: ctx.source,
            tz: ctx.tz,
            locale: ctx.locale,
            is_admin: ctx.is_admin,
            quota_per_unit: ctx.display.quota_per_unit,
            display: ctx.display,
            filter: ctx.filter,
            charts: ChartSync::new(ctx.display),
            tracker: RequestTracker::default(),
            users: Vec::new(),
            user_cursor: None,
            search: None,
            directory_error: None,
            notice: None,
            mounted: false,
            tx,
            rx,
        }
    }

    /// Creates the charts and issues the first query, once.
    fn mount(&mut self) {
        if self.mounted {
            return;
        }
        self.mounted = true;
        self.charts.ensure_initialized();
        self.dispatch();
        if self.is_admin {
            let source = Arc::clone(&self.source);
            let tx = self.tx.clone();
            thread::spawn(move || {
                let _ = tx.send(WorkerMessage::Users(source.users()));
            });
        }
    }

    fn dispatch(&mut self) {
        let seq = self.tracker.begin();
        let request = build_request(&self.filter, self.is_admin);
        let granularity = self.filter.granularity;
        tracing::info!(seq, scope = request.scope(), granularity = granularity.as_str(), "dispatching usage query");
        let source = Arc::clone(&self.source);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let result = source.usage(&request);
            let _ = tx.send(WorkerMessage::Usage {
                seq,
                granularity,
                result,
            });
        });
    }

    fn drain(&mut self, now: DateTime<Utc>) {
        while let Ok(msg) = self.rx.try_recv() {
            self.handle_message(msg, now);
        }
    }

    fn handle_message(&mut self, msg: WorkerMessage, now: DateTime<Utc>) {
        match msg {
            WorkerMessage::Usage {
                seq,
                granularity,
                result,
            } => {
                if !self.tracker.complete(seq) {
                    tracing::debug!(seq, "discarding stale usage response");
                    return;
                }
                match result {
                    Ok(records) => {
                        let agg = Aggregator::new(granularity, &self.tz, self.quota_per_unit)
                            .aggregate(&records, now);
                        self.charts.apply(&agg);
                        if let Some(bar) = self.charts.bar() {
                            tracing::debug!(
                                seq,
                                updates = bar.updates(),
                                layouts = bar.layouts(),
                                creations = self.charts.creations(),
                                "charts refreshed"
                            );
                        }
                        self.notice = Some(Notice::Info(format!(
                            "{} records at {} granularity",
                            records.len(),
                            granularity.as_str()
                        )));
                    }
                    Err(err) => {
                        tracing::warn!(%err, "usage query failed");
                        self.notice = Some(Notice::Error(err.to_string()));
                    }
                }
            }
            WorkerMessage::Users(Ok(users)) => {
                tracing::info!(users = users.len(), "user directory loaded");
                self.users = users;
            }
            WorkerMessage::Users(Err(FetchError::Backend(message))) => {
                tracing::warn!(%message, "user directory rejected");
                self.notice = Some(Notice::Error(message.clone()));
                self.directory_error = Some(message);
            }
            WorkerMessage::Users(Err(err)) => {
                tracing::warn!(%err, "could not load user directory");
            }
        }
    }

    fn handle_key(&mut self, code: KeyCode, now: DateTime<Utc>) -> Action {
        if self.search.is_some() {
            self.search_key(code);
            return Action::None;
        }
        match code {
            KeyCode::Char('q') | KeyCode::Esc => Action::Quit,
            KeyCode::Char('r') | KeyCode::Enter => Action::Query,
            KeyCode::Char('t') => self.preset(Preset::Today, now),
            KeyCode::Char('7') => self.preset(Preset::Last7Days, now),
            KeyCode::Char('3') => self.preset(Preset::Last30Days, now),
            KeyCode::Char('h') => self.set_granularity(Granularity::Hour),
            KeyCode::Char('d') => self.set_granularity(Granularity::Day),
            KeyCode::Char('w') => self.set_granularity(Granularity::Week),
            KeyCode::Char('u') => self.cycle_user(true),
            KeyCode::Char('U') => self.cycle_user(false),
            KeyCode::Char('/') if self.is_admin => {
                self.search = Some(String::new());
                Action::None
            }
            _ => Action::None,
        }
    }

    fn preset(&mut self, preset: Preset, now: DateTime<Utc>) -> Action {
        match self.filter.apply_preset(preset, now, &self.tz) {
            Ok(()) => Action::Query,
            Err(err) => {
                self.notice = Some(Notice::Error(err.to_string()));
                Action::None
            }
        }
    }

    fn set_granularity(&mut self, granularity: Granularity) -> Action {
        self.filter.granularity = granularity;
        self.notice = Some(Notice::Info(format!(
            "granularity set to {}, press r to query",
            granularity.as_str()
        )));
        Action::None
    }

    fn cycle_user(&mut self, forward: bool) -> Action {
        if !self.is_admin || self.users.is_empty() {
            return Action::None;
        }
        let len = self.users.len();
        let next = match (self.user_cursor, forward) {
            (None, true) => 0,
            (None, false) => len - 1,
            (Some(i), true) => (i + 1) % len,
            (Some(i), false) => (i + len - 1) % len,
        };
        self.select_user(next);
        Action::None
    }

    fn select_user(&mut self, idx: usize) {
        let Some(user) = self.users.get(idx) else {
            return;
        };
        self.user_cursor = Some(idx);
        self.filter.username = Some(user.username.clone());
        self.notice = Some(Notice::Info(format!("user: {}, press r to query", user.label())));
    }

    fn search_key(&mut self, code: KeyCode) {
        let Some(query) = self.search.as_mut() else {
            return;
        };
        match code {
            KeyCode::Esc => self.search = None,
            KeyCode::Enter => self.commit_search(),
            KeyCode::Backspace => {
                query.pop();
            }
            KeyCode::Char(c) => query.push(c),
            _ => {}
        }
    }

    /// Directory entries whose label or username contains `query`, ignoring case.
    fn matching_users(&self, query: &str) -> Vec<usize> {
        let needle = query.trim().to_lowercase();
        self.users
            .iter()
            .enumerate()
            .filter(|(_, user)| {
                user.label().to_lowercase().contains(&needle)
                    || user.username.to_lowercase().contains(&needle)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// An exact username wins, then the first match; unmatched text is used as a raw username.
    fn commit_search(&mut self) {
        let Some(query) = self.search.take() else {
            return;
        };
        let query = query.trim().to_string();
        let exact = self.users.iter().position(|u| u.username == query);
        match exact.or_else(|| self.matching_users(&query).first().copied()) {
            Some(idx) => self.select_user(idx),
            None => {
                self.user_cursor = None;
                self.notice = Some(Notice::Info(format!("user: {query}, press r to query")));
                self.filter.username = Some(query);
            }
        }
    }

    fn user_label(&self) -> String {
        if !self.is_admin {
            return "self".to_string();
        }
        if let Some(user) = self.user_cursor.and_then(|i| self.users.get(i)) {
            return user.label();
        }
        match self.filter.username.as_deref() {
            None | Some("") => "all users".to_string(),
            Some(name) => name.to_string(),
        }
    }

    fn render(&self, f: &mut ratatui::Frame<'_>) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(5),
                Constraint::Percentage(40),
                Constraint::Min(6),
                Constraint::Length(1),
            ])
            .split(f.size());

        self.render_filters(f, chunks[0]);
        if let Some(pie) = self.charts.pie() {
            render_pie(f, chunks[1], pie.spec(), &self.locale);
        }
        if let Some(bar) = self.charts.bar() {
            render_bar(f, chunks[2], bar.spec(), &self.display);
        }
        self.render_status(f, chunks[3]);
    }

    fn render_filters(&self, f: &mut ratatui::Frame<'_>, area: Rect) {
        let label = Style::default().add_modifier(Modifier::BOLD);
        let hint = Style::default().fg(Color::DarkGray);
        let mut keys = "[t] today  [7] 7 days  [3] 30 days  [h/d/w] granularity  ".to_string();
        if self.is_admin {
            keys.push_str("[u/U] user  [/] find user  ");
        }
        keys.push_str("[r] query  [q] quit");

        let mut user = vec![Span::styled("User ", label), Span::raw(self.user_label())];
        if let Some(err) = &self.directory_error {
            user.push(Span::styled(
                format!("  (directory unavailable: {err})"),
                Style::default().fg(Color::Red),
            ));
        }
        let mut first = vec![
            Span::styled("Range ", label),
            Span::raw(format!(
                "{} to {}   ",
                format_datetime(&self.filter.start),
                format_datetime(&self.filter.end)
            )),
            Span::styled("Granularity ", label),
            Span::raw(format!("{}   ", self.filter.granularity.as_str())),
        ];
        first.extend(user);

        let search = match &self.search {
            Some(query) => {
                let names: Vec<String> = self
                    .matching_users(query)
                    .into_iter()
                    .take(5)
                    .filter_map(|idx| self.users.get(idx).map(DashboardUser::label))
                    .collect();
                Line::from(vec![
                    Span::styled("Find user ", label),
                    Span::styled(format!("{query}_"), Style::default().fg(Color::Yellow)),
                    Span::styled(
                        format!("   {}   [Enter] select  [Esc] cancel", names.join(", ")),
                        hint,
                    ),
                ])
            }
            None => Line::from(""),
        };

        let lines = vec![Line::from(first), Line::from(Span::styled(keys, hint)), search];
        let block = TuiBlock::default()
            .borders(Borders::ALL)
            .title(Span::raw("Usage dashboard"));
        f.render_widget(Paragraph::new(lines).block(block), area);
    }

    fn render_status(&self, f: &mut ratatui::Frame<'_>, area: Rect) {
        let line = if self.tracker.is_loading() {
            Line::from(Span::styled("loading...", Style::default().fg(Color::Yellow)))
        } else {
            match &self.notice {
                Some(Notice::Error(msg)) => {
                    Line::from(Span::styled(format!("error: {msg}"), Style::default().fg(Color::Red)))
                }
                Some(Notice::Info(msg)) => Line::from(Span::raw(msg.clone())),
                None => Line::from(""),
            }
        };
        f.render_widget(Paragraph::new(line), area);
    }
}

fn model_style(model: &str) -> Style {
    let (r, g, b) = model_color(model);
    Style::default().fg(Color::Rgb(r, g, b))
}

fn render_pie(f: &mut ratatui::Frame<'_>, area: Rect, spec: &PieSpec, locale: &Locale) {
    let name_width = spec
        .values
        .iter()
        .map(|s| s.model.chars().count())
        .max()
        .unwrap_or(0);
    let lines: Vec<Line> = spec
        .values
        .iter()
        .map(|share| {
            let percent = spec.percent(share.value);
            let cells = (percent / 100.0 * PIE_BAR_CELLS as f64).round() as usize;
            Line::from(vec![
                Span::styled("■ ", model_style(&share.model)),
                Span::raw(format!(
                    "{:name_width$}  {:>10}  {:>6.1}%  ",
                    share.model,
                    format_count(share.value, locale),
                    percent
                )),
                Span::styled(BAR_GLYPH.repeat(cells), model_style(&share.model)),
            ])
        })
        .collect();
    let block = TuiBlock::default()
        .borders(Borders::ALL)
        .title(Span::raw(format!("{} | {}", spec.title, spec.subtitle)));
    f.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_bar(f: &mut ratatui::Frame<'_>, area: Rect, spec: &BarSpec, display: &QuotaDisplay) {
    let block = TuiBlock::default()
        .borders(Borders::ALL)
        .title(Span::raw(format!("{} | {}", spec.title, spec.subtitle)));
    let inner_height = area.height.saturating_sub(2) as usize;
    let inner_width = area.width.saturating_sub(2) as usize;

    let stacks = spec.stacks();
    // Keep the newest buckets when the panel is too short; one line is the legend.
    let visible = inner_height.saturating_sub(1).min(stacks.len());
    let shown = &stacks[stacks.len() - visible..];
    let label_width = shown.iter().map(|s| s.label.chars().count()).max().unwrap_or(0);
    let totals: Vec<String> = shown.iter().map(|s| display.render_usage(s.total, 4)).collect();
    let total_width = totals.iter().map(|t| t.chars().count()).max().unwrap_or(0);
    let bar_width = inner_width.saturating_sub(label_width + total_width + 4);
    let scale_max = shown.iter().map(|s| s.total).fold(0.0, f64::max);

    let mut lines: Vec<Line> = Vec::with_capacity(visible + 1);
    for (stack, total) in shown.iter().zip(&totals) {
        let values: Vec<f64> = stack.segments.iter().map(|(_, v)| *v).collect();
        let widths = segment_widths(&values, scale_max, bar_width);
        let mut spans = vec![Span::raw(format!("{:label_width$} │", stack.label))];
        let mut drawn = 0;
        for ((model, _), cells) in stack.segments.iter().zip(widths) {
            drawn += cells;
            spans.push(Span::styled(BAR_GLYPH.repeat(cells), model_style(model)));
        }
        spans.push(Span::raw(" ".repeat(bar_width.saturating_sub(drawn) + 1)));
        spans.push(Span::raw(format!("{total:>total_width$}")));
        lines.push(Line::from(spans));
    }

    let mut legend = Vec::new();
    for model in spec.models() {
        legend.push(Span::styled("■ ", model_style(model)));
        legend.push(Span::raw(format!("{model}  ")));
    }
    lines.push(Line::from(legend));

    f.render_widget(Paragraph::new(lines).block(block), area);
}

pub fn run(ctx: DashboardContext) -> Result<()> {
    let mut app = Dashboard::new(ctx);
    app.mount();

    let mut stdout = std::io::stdout();
    enable_raw_mode().context("enable raw mode")?;
    stdout
        .execute(EnterAlternateScreen)
        .context("enter alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("init terminal")?;
    terminal.clear().ok();

    let res = (|| -> Result<()> {
        loop {
            app.drain(Utc::now());
            terminal.draw(|f| app.render(f))?;

            if event::poll(Duration::from_millis(100))? {
                if let Event::Key(k) = event::read()? {
                    if k.kind != KeyEventKind::Press {
                        continue;
                    }
                    match app.handle_key(k.code, Utc::now()) {
                        Action::Quit => return Ok(()),
                        Action::Query => app.dispatch(),
                        Action::None => {}
                    }
                }
            }
        }
    })();

    disable_raw_mode().ok();
    let _ = terminal.backend_mut().execute(LeaveAlternateScreen);
    let _ = terminal.show_cursor();
    res
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{aggregate::DEFAULT_QUOTA_PER_UNIT, query::UsageRequest};

    const SLOW_QUERY: Duration = Duration::from_millis(200);

    /// Answers day queries slowly; the model name records which granularity was asked for.
    struct FakeSource {
        calls: AtomicUsize,
        user_calls: AtomicUsize,
        fail: bool,
        directory_error: Option<String>,
    }

    impl FakeSource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(FakeSource {
                calls: AtomicUsize::new(0),
                user_calls: AtomicUsize::new(0),
                fail,
                directory_error: None,
            })
        }

        fn rejecting_directory(message: &str) -> Arc<Self> {
            Arc::new(FakeSource {
                calls: AtomicUsize::new(0),
                user_calls: AtomicUsize::new(0),
                fail: false,
                directory_error: Some(message.to_string()),
            })
        }
    }

    impl UsageSource for FakeSource {
        fn usage(&self, request: &UsageRequest) -> Result<Vec<UsageRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.granularity == Granularity::Day {
                thread::sleep(SLOW_QUERY);
            }
            if self.fail {
                return Err(FetchError::Backend("quota service down".into()));
            }
            Ok(vec![UsageRecord {
                model_name: format!("{}-query", request.granularity.as_str()),
                count: 2,
                quota: 1_000.0,
                created_at: 3_600,
            }])
        }

        fn users(&self) -> Result<Vec<DashboardUser>, FetchError> {
            self.user_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.directory_error {
                return Err(FetchError::Backend(message.clone()));
            }
            Ok(vec![
                DashboardUser {
                    id: 0,
                    username: String::new(),
                    display_name: "All users".into(),
                },
                DashboardUser {
                    id: 5,
                    username: "alice".into(),
                    display_name: "Alice".into(),
                },
                DashboardUser {
                    id: 6,
                    username: "bob".into(),
                    display_name: String::new(),
                },
                DashboardUser {
                    id: 8,
                    username: "alina".into(),
                    display_name: "Alina K".into(),
                },
            ])
        }
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-12-03T15:20:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn dashboard(source: Arc<FakeSource>, is_admin: bool) -> Dashboard {
        Dashboard::new(DashboardContext {
            source,
            tz: Tz::UTC,
            locale: Locale::en,
            is_admin,
            display: QuotaDisplay {
                quota_per_unit: DEFAULT_QUOTA_PER_UNIT,
                in_currency: true,
            },
            filter: QueryFilter::initial(now(), &Tz::UTC, Some(Granularity::Day)),
        })
    }

    fn with_directory(is_admin: bool) -> Dashboard {
        let source = FakeSource::new(false);
        let mut app = dashboard(Arc::clone(&source), is_admin);
        app.handle_message(WorkerMessage::Users(source.users()), now());
        app
    }

    fn pump(app: &mut Dashboard, messages: usize) {
        for _ in 0..messages {
            let msg = app
                .rx
                .recv_timeout(Duration::from_secs(5))
                .expect("worker message");
            app.handle_message(msg, now());
        }
    }

    fn type_text(app: &mut Dashboard, text: &str) {
        for c in text.chars() {
            assert_eq!(app.handle_key(KeyCode::Char(c), now()), Action::None);
        }
    }

    #[test]
    fn tracker_only_accepts_latest() {
        let mut tracker = RequestTracker::default();
        assert!(!tracker.is_loading());
        let first = tracker.begin();
        let second = tracker.begin();
        assert!(tracker.is_loading());
        assert!(!tracker.complete(first));
        assert!(tracker.is_loading());
        assert!(tracker.complete(second));
        assert!(!tracker.is_loading());
    }

    #[test]
    fn mount_happens_once() {
        let source = FakeSource::new(false);
        let mut app = dashboard(Arc::clone(&source), true);
        app.mount();
        app.mount();
        pump(&mut app, 2);

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.user_calls.load(Ordering::SeqCst), 1);
        assert_eq!(app.charts.creations(), 1);
        assert_eq!(app.users.len(), 4);
        let bar = app.charts.bar().unwrap();
        assert_eq!(bar.updates(), 1);
        assert_eq!(bar.spec().values[0].model, "day-query");
        assert!(!app.tracker.is_loading());
    }

    #[test]
    fn slow_earlier_query_cannot_overwrite_newer() {
        let source = FakeSource::new(false);
        let mut app = dashboard(Arc::clone(&source), false);
        app.charts.ensure_initialized();

        // The day query is slow, so it finishes after the hour query below.
        app.dispatch();
        app.filter.granularity = Granularity::Hour;
        app.dispatch();

        pump(&mut app, 1);
        let bar = app.charts.bar().unwrap();
        assert_eq!(bar.spec().values[0].model, "hour-query");
        assert!(!app.tracker.is_loading());

        pump(&mut app, 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        let bar = app.charts.bar().unwrap();
        assert_eq!(bar.updates(), 1);
        assert_eq!(bar.spec().values.len(), 1);
        assert_eq!(bar.spec().values[0].model, "hour-query");
        assert_eq!(bar.spec().values[0].time_label, "01-01 01:00");
        assert_eq!(app.charts.pie().unwrap().spec().values[0].model, "hour-query");
        assert_eq!(app.charts.creations(), 1);
    }

    #[test]
    fn failures_leave_charts_stale() {
        let source = FakeSource::new(true);
        let mut app = dashboard(source, false);
        app.mount();
        pump(&mut app, 1);

        assert_eq!(app.charts.bar().unwrap().updates(), 0);
        assert_eq!(app.charts.pie().unwrap().spec(), &PieSpec::placeholder());
        assert_eq!(app.notice, Some(Notice::Error("quota service down".into())));
    }

    #[test]
    fn directory_rejection_is_shown() {
        let source = FakeSource::rejecting_directory("no permission for directory");
        let mut app = dashboard(source, true);
        app.mount();
        pump(&mut app, 2);

        assert!(app.users.is_empty());
        assert_eq!(app.directory_error.as_deref(), Some("no permission for directory"));
        assert_eq!(app.charts.bar().unwrap().updates(), 1);

        app.handle_message(
            WorkerMessage::Users(Err(FetchError::Backend("no permission for directory".into()))),
            now(),
        );
        assert_eq!(
            app.notice,
            Some(Notice::Error("no permission for directory".into()))
        );
    }

    #[test]
    fn directory_transport_failure_is_only_logged() {
        let source = FakeSource::new(false);
        let mut app = dashboard(source, true);
        app.handle_message(
            WorkerMessage::Users(Err(FetchError::Status {
                url: "http://gw.test/api/user/dashboard/users".into(),
                code: 502,
            })),
            now(),
        );
        assert!(app.users.is_empty());
        assert_eq!(app.notice, None);
        assert_eq!(app.directory_error, None);
        assert_eq!(app.handle_key(KeyCode::Char('u'), now()), Action::None);
        assert_eq!(app.filter.username, None);
    }

    #[test]
    fn presets_requery_and_granularity_waits() {
        let source = FakeSource::new(false);
        let mut app = dashboard(source, false);

        assert_eq!(app.handle_key(KeyCode::Char('t'), now()), Action::Query);
        assert_eq!(format_datetime(&app.filter.start), "2024-12-03 00:00:00");
        assert_eq!(app.filter.end.timestamp(), 1_733_270_399);

        assert_eq!(app.handle_key(KeyCode::Char('w'), now()), Action::None);
        assert_eq!(app.filter.granularity, Granularity::Week);
        assert_eq!(app.handle_key(KeyCode::Char('q'), now()), Action::Quit);
        assert_eq!(app.handle_key(KeyCode::Enter, now()), Action::Query);
    }

    #[test]
    fn today_preset_survives_midnight_gap() {
        let source = FakeSource::new(false);
        let mut app = dashboard(source, false);
        app.tz = "America/Santiago".parse().unwrap();
        let now = DateTime::parse_from_rfc3339("2024-09-08T15:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(app.handle_key(KeyCode::Char('t'), now), Action::Query);
        assert_eq!(format_datetime(&app.filter.start), "2024-09-08 01:00:00");
        assert_eq!(app.notice, None);
    }

    #[test]
    fn admin_cycles_through_directory() {
        let mut app = with_directory(true);

        app.handle_key(KeyCode::Char('u'), now());
        assert_eq!(app.filter.username.as_deref(), Some(""));
        assert_eq!(app.user_label(), "All users");
        app.handle_key(KeyCode::Char('u'), now());
        assert_eq!(app.filter.username.as_deref(), Some("alice"));
        assert_eq!(app.user_label(), "Alice (alice)");
        app.handle_key(KeyCode::Char('U'), now());
        assert_eq!(app.filter.username.as_deref(), Some(""));

        let request = build_request(&app.filter, app.is_admin);
        assert_eq!(request.username(), Some(""));
    }

    #[test]
    fn search_filters_directory() {
        let mut app = with_directory(true);
        assert_eq!(app.handle_key(KeyCode::Char('/'), now()), Action::None);
        type_text(&mut app, "ALI");
        assert_eq!(app.search.as_deref(), Some("ALI"));
        assert_eq!(app.matching_users("ALI"), vec![1, 3]);
        assert_eq!(app.matching_users("bob"), vec![2]);
        assert_eq!(app.matching_users("all"), vec![0]);
        assert_eq!(app.matching_users(""), vec![0, 1, 2, 3]);

        app.handle_key(KeyCode::Backspace, now());
        type_text(&mut app, "ina");
        assert_eq!(app.handle_key(KeyCode::Enter, now()), Action::None);
        assert_eq!(app.search, None);
        assert_eq!(app.filter.username.as_deref(), Some("alina"));
        assert_eq!(app.user_label(), "Alina K (alina)");
    }

    #[test]
    fn search_keys_are_text_not_commands() {
        let mut app = with_directory(true);
        app.handle_key(KeyCode::Char('/'), now());
        type_text(&mut app, "qrt");
        assert_eq!(app.search.as_deref(), Some("qrt"));
        assert_eq!(app.handle_key(KeyCode::Esc, now()), Action::None);
        assert_eq!(app.search, None);
        assert_eq!(app.filter.username, None);
    }

    #[test]
    fn search_accepts_unlisted_username() {
        let source = FakeSource::new(false);
        let mut app = dashboard(source, true);
        app.handle_key(KeyCode::Char('/'), now());
        type_text(&mut app, "carol");
        app.handle_key(KeyCode::Enter, now());

        assert_eq!(app.filter.username.as_deref(), Some("carol"));
        assert_eq!(app.user_cursor, None);
        assert_eq!(app.user_label(), "carol");
        let request = build_request(&app.filter, app.is_admin);
        assert_eq!(request.username(), Some("carol"));
    }

    #[test]
    fn search_is_admin_only() {
        let mut app = with_directory(false);
        app.handle_key(KeyCode::Char('/'), now());
        assert_eq!(app.search, None);
    }
}
