//! Terminal dashboard for a running `bridge_pool_api`, polling its HTTP API.
//!
//! Overview (workers and the tasks they are running)
//! Queue (tasks waiting for a worker, highest priority first)
//! Stats (pool counters by task type and status)

use std::{
  env,
  error::Error,
  io,
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use bridge_pool::models::{PoolStats, TaskSnapshot, TaskStatus, WorkerSnapshot};
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;
use tokio_retry::{
  Retry,
  strategy::{ExponentialBackoff, jitter},
};
use tui::{
  Terminal,
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const QUEUE_ROWS: usize = 10;

#[derive(Clone, Copy)]
enum DashboardTab {
  Overview,
  Queue,
  Stats,
}

struct App {
  current_tab: DashboardTab,
  workers: Vec<WorkerSnapshot>,
  tasks: Vec<TaskSnapshot>,
  stats: PoolStats,
  last_error: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Overview,
      workers: vec![],
      tasks: vec![],
      stats: PoolStats::default(),
      last_error: None,
    }
  }

  fn apply(&mut self, state: Result<Snapshot, String>) {
    match state {
      Ok(snapshot) => {
        self.workers = snapshot.workers;
        self.tasks = snapshot.tasks;
        self.stats = snapshot.stats;
        self.last_error = None;
      }
      Err(e) => self.last_error = Some(e),
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Queue,
      DashboardTab::Queue => DashboardTab::Stats,
      DashboardTab::Stats => DashboardTab::Overview,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Overview => DashboardTab::Stats,
      DashboardTab::Queue => DashboardTab::Overview,
      DashboardTab::Stats => DashboardTab::Queue,
    }
  }

  fn queued(&self) -> Vec<&TaskSnapshot> {
    let mut queued: Vec<&TaskSnapshot> = self.tasks.iter().filter(|t| t.status == TaskStatus::Queued).collect();
    queued.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    queued
  }
}

struct Snapshot {
  workers: Vec<WorkerSnapshot>,
  tasks: Vec<TaskSnapshot>,
  stats: PoolStats,
}

async fn fetch<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> Result<T, reqwest::Error> {
  let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(3);
  Retry::start(strategy, || async move {
    client.get(url).send().await?.error_for_status()?.json::<T>().await
  })
  .await
}

async fn fetch_pool_state(client: &reqwest::Client, base_url: &str) -> Result<Snapshot, reqwest::Error> {
  let workers = fetch(client, &format!("{base_url}/workers")).await?;
  let tasks = fetch(client, &format!("{base_url}/tasks")).await?;
  let stats = fetch(client, &format!("{base_url}/stats")).await?;
  Ok(Snapshot { workers, tasks, stats })
}

fn main() -> Result<(), Box<dyn Error>> {
  let base_url = env::var("DASHBOARD_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
  let base_url = base_url.trim_end_matches('/').to_string();
  let rt = Runtime::new()?;
  let client = reqwest::Client::builder().timeout(Duration::from_secs(5)).build()?;

  let (tx, rx) = mpsc::channel::<Result<Snapshot, String>>();
  thread::spawn(move || {
    loop {
      let state = rt.block_on(fetch_pool_state(&client, &base_url)).map_err(|e| e.to_string());
      if tx.send(state).is_err() {
        break;
      }
      thread::sleep(POLL_INTERVAL);
    }
  });

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    while let Ok(state) = rx.try_recv() {
      app.apply(state);
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate.checked_sub(last_tick.elapsed()).unwrap_or_default();
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)].as_ref())
    .split(f.size());

  let tab_titles = ["Overview", "Queue", "Stats"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
  .block(Block::default().borders(Borders::ALL).title("Bridge Worker Pool"))
  .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
  .select(match app.current_tab {
    DashboardTab::Overview => 0,
    DashboardTab::Queue => 1,
    DashboardTab::Stats => 2,
  });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Overview => render_overview(f, app, chunks[1]),
    DashboardTab::Queue => render_queue(f, app, chunks[1]),
    DashboardTab::Stats => render_stats(f, app, chunks[1]),
  }

  let footer = match &app.last_error {
    Some(e) => Paragraph::new(format!("API unreachable: {e}")).style(Style::default().fg(Color::Red)),
    None => Paragraph::new("←/→: Switch Tabs | q: Quit").style(Style::default().fg(Color::White)),
  };
  f.render_widget(footer.block(Block::default().borders(Borders::ALL)), chunks[2]);
}

fn status_color(status: &str) -> Color {
  match status {
    "idle" => Color::Green,
    "busy" => Color::Yellow,
    "crashed" => Color::Red,
    _ => Color::Gray,
  }
}

fn render_overview<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let worker_items: Vec<ListItem> = app
    .workers
    .iter()
    .map(|w| {
      let status = format!("{:?}", w.status).to_lowercase();
      let task_info = match w.current_task_id {
        Some(id) => format!("Task: {id}"),
        None => "No current task".into(),
      };
      let usage = match (w.cpu_usage, w.memory_usage) {
        (Some(cpu), Some(memory)) => format!("CPU: {:.1}% | Mem: {} KiB", cpu, memory / 1024),
        _ => "No metrics yet".into(),
      };
      let lines = vec![
        Spans::from(vec![
          Span::styled(format!("Worker {} ", w.id), Style::default().add_modifier(Modifier::BOLD)),
          Span::styled(status.clone(), Style::default().fg(status_color(&status))),
        ]),
        Spans::from(Span::raw(task_info)),
        Spans::from(Span::raw(format!("Done: {} | Failed: {}", w.tasks_processed, w.tasks_failed))),
        Spans::from(Span::raw(usage)),
      ];
      ListItem::new(lines)
    })
    .collect();

  let workers_list = List::new(worker_items)
    .block(Block::default().borders(Borders::ALL).title(format!("Workers ({})", app.workers.len())))
    .highlight_style(Style::default().bg(Color::Blue));
  f.render_widget(workers_list, chunks[0]);

  let active_tasks: Vec<ListItem> = app
    .tasks
    .iter()
    .filter(|t| t.status == TaskStatus::Running)
    .map(|t| {
      let worker = t.worker_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into());
      ListItem::new(Spans::from(vec![Span::raw(format!(
        "worker {}: {} (attempt {})",
        worker,
        t.task_type,
        t.retries + 1
      ))]))
    })
    .collect();
  let tasks_list = List::new(if active_tasks.is_empty() {
    vec![ListItem::new(Spans::from(Span::raw("No active tasks")))]
  } else {
    active_tasks
  })
  .block(Block::default().borders(Borders::ALL).title("Active Tasks"));
  f.render_widget(tasks_list, chunks[1]);
}

fn render_queue<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let queued = app.queued();
  let task_items: Vec<ListItem> = queued
    .iter()
    .take(QUEUE_ROWS)
    .map(|t| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{} ", t.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::raw(format!("Type: {} | Priority: {:?} | Retries: {}/{}", t.task_type, t.priority, t.retries, t.max_retries)),
      ]))
    })
    .collect();
  let header = format!("Next {} Tasks in Queue (Queued: {})", QUEUE_ROWS, app.stats.queued_tasks);
  let tasks_list = List::new(task_items).block(Block::default().borders(Borders::ALL).title(header));
  f.render_widget(tasks_list, area);
}

fn render_stats<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(34), Constraint::Percentage(33), Constraint::Percentage(33)].as_ref())
    .split(area);

  let stats = &app.stats;
  let pool_lines = vec![
    ListItem::new(Span::raw(format!("Running: {}", stats.running))),
    ListItem::new(Span::raw(format!("Workers: {}", stats.worker_count))),
    ListItem::new(Span::raw(format!("Idle: {}", stats.idle_workers))),
    ListItem::new(Span::raw(format!("Busy: {}", stats.busy_workers))),
    ListItem::new(Span::raw(format!("Queued: {}", stats.queued_tasks))),
    ListItem::new(Span::raw(format!("Active tasks: {}", stats.active_tasks))),
  ];
  f.render_widget(List::new(pool_lines).block(Block::default().borders(Borders::ALL).title("Pool")), chunks[0]);

  let by_type: Vec<ListItem> = stats
    .tasks_by_type
    .iter()
    .map(|(task_type, count)| ListItem::new(Span::raw(format!("{task_type}: {count}"))))
    .collect();
  f.render_widget(List::new(by_type).block(Block::default().borders(Borders::ALL).title("By Type")), chunks[1]);

  let by_status: Vec<ListItem> = stats
    .tasks_by_status
    .iter()
    .map(|(status, count)| {
      ListItem::new(Spans::from(vec![
        Span::styled(format!("{status:?}"), Style::default().fg(Color::Green)),
        Span::raw(format!(": {count}")),
      ]))
    })
    .collect();
  f.render_widget(List::new(by_status).block(Block::default().borders(Borders::ALL).title("By Status")), chunks[2]);
}
