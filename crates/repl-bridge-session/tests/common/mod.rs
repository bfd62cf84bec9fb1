//! A scripted stand-in for R that speaks the session protocol.
//!
//! It understands just enough of the injected helpers to answer the setup
//! handshake, run side-log requests and echo scrape requests, and it
//! evaluates a handful of toy statements (`x <- 1`, `print(x)`, `cat`,
//! `message`, `warning`, `stop`, `plot`, `kable`, `Sys.sleep`, `q()`).

#![allow(dead_code)]

use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use repl_bridge_core::{
    BridgeConfig, Capabilities, ChannelPreference, LaunchSpec, ProcessControl, ProcessSpawner,
    SessionContext, SpawnError, SpawnedSession,
};
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
    task::AbortHandle,
};

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-plot";
pub const TABLE_HTML: &str = "<table>\n<tr><td>1</td></tr>\n</table>";

#[derive(Debug, Clone, Copy)]
pub struct FakeOptions {
    /// Terminal-style echo of every input line.
    pub echo: bool,
    /// Whether the side log can be written.
    pub side_log_writable: bool,
    /// Number of setup injections silently swallowed.
    pub ignore_setup: usize,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            echo: true,
            side_log_writable: true,
            ignore_setup: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeSpawner {
    pub options: FakeOptions,
    spawned: Arc<AtomicUsize>,
    launches: Arc<Mutex<Vec<LaunchSpec>>>,
    writes: WriteLog,
}

impl FakeSpawner {
    pub fn new(options: FakeOptions) -> Self {
        Self {
            options,
            spawned: Arc::default(),
            launches: Arc::default(),
            writes: Arc::default(),
        }
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    /// Every write made to any spawned interpreter, with its time.
    pub fn writes(&self) -> Vec<(Instant, String)> {
        self.writes.lock().unwrap().clone()
    }
}

type ExitSlot = Arc<Mutex<Option<oneshot::Sender<Option<i32>>>>>;
type WriteLog = Arc<Mutex<Vec<(Instant, String)>>>;

struct FakeControl {
    input: mpsc::UnboundedSender<Vec<u8>>,
    writes: WriteLog,
    abort: AbortHandle,
    exit: ExitSlot,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.writes
            .lock()
            .unwrap()
            .push((Instant::now(), String::from_utf8_lossy(data).into_owned()));
        self.input
            .send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interpreter exited"))
    }

    fn resize(&self, _cols: u16, _rows: u16) -> io::Result<()> {
        Ok(())
    }

    fn kill(&self) -> io::Result<()> {
        self.abort.abort();
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(None);
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(
        &self,
        spec: &LaunchSpec,
        ctx: &SessionContext,
    ) -> Result<SpawnedSession, SpawnError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.launches.lock().unwrap().push(spec.clone());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let exit: ExitSlot = Arc::new(Mutex::new(Some(exit_tx)));

        let fake = FakeR {
            options: self.options,
            ns: ctx.namespace.clone(),
            side_log: ctx.side_log.clone(),
            ready_file: ctx.ready_file.clone(),
            plot_dir: ctx.plot_dir.clone(),
            token: ctx.ready_token.clone(),
            out: output_tx,
            vars: HashMap::new(),
            setups_seen: 0,
            plots: 0,
        };
        let task = tokio::spawn(fake.run(input_rx, Arc::clone(&exit)));

        Ok(SpawnedSession {
            control: Box::new(FakeControl {
                input: input_tx,
                writes: Arc::clone(&self.writes),
                abort: task.abort_handle(),
                exit,
            }),
            output: output_rx,
            exit: exit_rx,
            capabilities: Capabilities {
                echoes_input: self.options.echo,
                resizable: true,
            },
            pid: Some(4242),
        })
    }
}

/// Config pointing at a throwaway state root and a dummy executable.
pub fn test_config(root: &Path, channel: ChannelPreference) -> BridgeConfig {
    let exe = root.join("fake-R");
    std::fs::write(&exe, "").unwrap();
    BridgeConfig {
        submit_timeout_ms: 5_000,
        setup_timeout_ms: 3_000,
        setup_attempts: 3,
        poll_interval_ms: 10,
        channel,
        interpreter: Some(exe),
        state_root: Some(root.join("state")),
        ..BridgeConfig::default()
    }
}

enum Block {
    SideLog {
        id: String,
        mode: String,
        pieces: Vec<String>,
    },
    Capture {
        html: bool,
        body: Vec<String>,
    },
}

enum Effect {
    Out(String),
    Message(String),
    Warning(String),
    Error(String),
    Plot,
    Html(String),
    Sleep(Duration),
    Quit,
}

enum Flow {
    Continue,
    Quit,
}

struct FakeR {
    options: FakeOptions,
    ns: String,
    side_log: PathBuf,
    ready_file: PathBuf,
    plot_dir: PathBuf,
    token: String,
    out: mpsc::UnboundedSender<Bytes>,
    vars: HashMap<String, String>,
    setups_seen: usize,
    plots: usize,
}

impl FakeR {
    async fn run(mut self, mut input: mpsc::UnboundedReceiver<Vec<u8>>, exit: ExitSlot) {
        let mut pending = String::new();
        let mut block: Option<Block> = None;
        self.emit("> ");

        'outer: while let Some(chunk) = input.recv().await {
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(nl) = pending.find('\n') {
                let line: String = pending.drain(..=nl).collect();
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if self.options.echo {
                    self.emit(&format!("{line}\n"));
                }
                let flow = self.on_line(&line, &mut block).await;
                if matches!(flow, Flow::Quit) {
                    break 'outer;
                }
                self.emit(if block.is_some() { "+ " } else { "> " });
            }
        }

        if let Some(tx) = exit.lock().unwrap().take() {
            let _ = tx.send(Some(0));
        }
    }

    fn emit(&self, text: &str) {
        let _ = self.out.send(Bytes::from(text.to_string()));
    }

    async fn on_line(&mut self, line: &str, block: &mut Option<Block>) -> Flow {
        match block.take() {
            Some(Block::SideLog {
                id,
                mode,
                mut pieces,
            }) => {
                if line.trim() == "))" {
                    let code: String = pieces.iter().map(|p| unquote(p)).collect();
                    return self.run_side_log(&id, &mode, &code).await;
                }
                pieces.push(line.trim().trim_end_matches(',').to_string());
                *block = Some(Block::SideLog { id, mode, pieces });
                return Flow::Continue;
            }
            Some(Block::Capture { html, mut body }) => {
                if line.trim() == "})" {
                    return self.run_capture(html, &body.join("\n")).await;
                }
                body.push(line.to_string());
                *block = Some(Block::Capture { html, body });
                return Flow::Continue;
            }
            None => {}
        }

        let run_prefix = format!(".{}$run(", self.ns);
        if let Some(rest) = line.strip_prefix(&run_prefix) {
            let quoted: Vec<&str> = rest.split('"').collect();
            *block = Some(Block::SideLog {
                id: quoted.get(1).copied().unwrap_or_default().to_string(),
                mode: quoted.get(3).copied().unwrap_or_default().to_string(),
                pieces: Vec::new(),
            });
            return Flow::Continue;
        }
        if line.starts_with(&format!(".{}_capture_plot({{", self.ns)) {
            *block = Some(Block::Capture {
                html: false,
                body: Vec::new(),
            });
            return Flow::Continue;
        }
        if line.starts_with(&format!(".{}_capture_html({{", self.ns)) {
            *block = Some(Block::Capture {
                html: true,
                body: Vec::new(),
            });
            return Flow::Continue;
        }
        if let Some(path) = line.strip_prefix("source(").and_then(|r| r.strip_suffix(')')) {
            self.run_setup(&unquote(path)).await;
            return Flow::Continue;
        }

        for effect in self.eval_code(line) {
            match effect {
                Effect::Out(text) => self.emit(&text),
                Effect::Html(_) => self.emit("|x |\n|--|\n|1 |\n"),
                Effect::Plot => {}
                Effect::Quit => return Flow::Quit,
                other => self.show(other).await,
            }
        }
        Flow::Continue
    }

    /// Stream rendering shared by every mode.
    async fn show(&self, effect: Effect) {
        match effect {
            Effect::Out(text) => self.emit(&text),
            Effect::Message(text) => self.emit(&format!("{text}\n")),
            Effect::Warning(text) => self.emit(&format!("Warning message:\n{text} \n")),
            Effect::Error(text) => self.emit(&format!("Error: {text}\n")),
            Effect::Sleep(d) => tokio::time::sleep(d).await,
            Effect::Plot | Effect::Html(_) | Effect::Quit => {}
        }
    }

    async fn run_setup(&mut self, path: &str) {
        self.setups_seen += 1;
        if self.setups_seen <= self.options.ignore_setup {
            return;
        }
        let script = tokio::fs::read_to_string(path).await.unwrap_or_default();
        let side_log = script.contains("side_log <- TRUE") && self.options.side_log_writable;
        if side_log {
            tokio::fs::write(&self.ready_file, format!("{}\n", self.token))
                .await
                .unwrap();
        }
        let channel = if side_log { "side_log" } else { "scrape" };
        self.emit(&format!("###{}_READY:{channel}:{}###\n", self.ns, self.token));
    }

    async fn run_side_log(&mut self, id: &str, mode: &str, code: &str) -> Flow {
        let want_plot = matches!(mode, "auto" | "image");
        let want_html = matches!(mode, "auto" | "markup");
        let mut plots = Vec::new();
        let mut output = String::new();

        self.record("CELL_START", id, "").await;
        for effect in self.eval_code(code) {
            match effect {
                Effect::Out(text) => {
                    self.emit(&text);
                    output.push_str(&text);
                }
                Effect::Plot if want_plot => {
                    let path = self.plot_dir.join(format!("{id}_{:03}.png", plots.len() + 1));
                    tokio::fs::write(&path, PNG_BYTES).await.unwrap();
                    plots.push(path);
                }
                Effect::Plot => {}
                Effect::Html(html) if want_html => {
                    self.flush_output(id, &mut output).await;
                    self.record("HTML", id, &html).await;
                }
                Effect::Html(_) => output.push_str("|x |\n|--|\n|1 |\n"),
                Effect::Message(text) => {
                    self.flush_output(id, &mut output).await;
                    self.record("MESSAGE", id, &text).await;
                    self.show(Effect::Message(text)).await;
                }
                Effect::Warning(text) => {
                    self.flush_output(id, &mut output).await;
                    self.record("WARNING", id, &text).await;
                    self.show(Effect::Warning(text)).await;
                }
                Effect::Error(text) => {
                    self.flush_output(id, &mut output).await;
                    self.record("ERROR", id, &text).await;
                    self.show(Effect::Error(text)).await;
                }
                Effect::Sleep(d) => {
                    self.flush_output(id, &mut output).await;
                    tokio::time::sleep(d).await;
                }
                Effect::Quit => return Flow::Quit,
            }
        }
        self.flush_output(id, &mut output).await;
        for plot in plots {
            self.record("PLOT", id, &plot.display().to_string()).await;
        }
        self.record("CELL_END", id, "").await;
        Flow::Continue
    }

    async fn run_capture(&mut self, html: bool, body: &str) -> Flow {
        for effect in self.eval_code(body) {
            match effect {
                Effect::Plot if !html => {
                    self.plots += 1;
                    let path = self.plot_dir.join(format!("plot_{}.png", self.plots));
                    tokio::fs::write(&path, PNG_BYTES).await.unwrap();
                    self.emit(&format!(
                        "###{}_PLOT###{}###END_PLOT###\n",
                        self.ns,
                        path.display()
                    ));
                }
                Effect::Html(table) if html => {
                    self.emit(&format!(
                        "###{ns}_HTML_START###\n{table}\n###{ns}_HTML_END###\n",
                        ns = self.ns
                    ));
                }
                Effect::Html(_) => self.emit("|x |\n|--|\n|1 |\n"),
                Effect::Quit => return Flow::Quit,
                other => self.show(other).await,
            }
        }
        Flow::Continue
    }

    async fn flush_output(&self, id: &str, output: &mut String) {
        if output.is_empty() {
            return;
        }
        let text = std::mem::take(output);
        self.record("OUTPUT", id, text.strip_suffix('\n').unwrap_or(&text))
            .await;
    }

    /// Append one framed record, in two writes so readers see partial
    /// frames.
    async fn record(&self, kind: &str, id: &str, content: &str) {
        let escaped: Vec<String> = content
            .split('\n')
            .map(|line| {
                if line.trim_start_matches('\\') == "###END###" {
                    format!("\\{line}")
                } else {
                    line.to_string()
                }
            })
            .collect();
        let frame = format!("###{kind}:{id}###\n{}\n###END###\n", escaped.join("\n"));
        let (head, tail) = frame.split_at(frame.len() / 2);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.side_log)
            .await
            .unwrap();
        file.write_all(head.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        file.write_all(tail.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }

    fn eval_code(&mut self, code: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        for stmt in code.split('\n').flat_map(split_statements) {
            let before = effects.len();
            self.eval_statement(stmt.trim(), &mut effects);
            if effects[before..]
                .iter()
                .any(|e| matches!(e, Effect::Error(_) | Effect::Quit))
            {
                break;
            }
        }
        effects
    }

    fn eval_statement(&mut self, stmt: &str, effects: &mut Vec<Effect>) {
        if stmt.is_empty() || stmt == "NULL" || stmt.starts_with("rm(") || stmt.starts_with("invisible(")
        {
            return;
        }
        if stmt == "q()" || stmt.starts_with("quit(") {
            effects.push(Effect::Quit);
            return;
        }
        if let Some(arg) = call(stmt, "print") {
            match self.value(arg) {
                Ok(v) => effects.push(Effect::Out(format!("[1] {v}\n"))),
                Err(e) => effects.push(Effect::Error(e)),
            }
            return;
        }
        if let Some(arg) = call(stmt, "cat") {
            effects.push(Effect::Out(unquote(arg)));
            return;
        }
        if let Some(arg) = call(stmt, "message") {
            effects.push(Effect::Message(unquote(arg)));
            return;
        }
        if let Some(arg) = call(stmt, "warning") {
            effects.push(Effect::Warning(unquote(arg)));
            return;
        }
        if let Some(arg) = call(stmt, "stop") {
            effects.push(Effect::Error(unquote(arg)));
            return;
        }
        if let Some(arg) = call(stmt, "Sys.sleep") {
            let secs: f64 = arg.trim().parse().unwrap_or(0.0);
            effects.push(Effect::Sleep(Duration::from_secs_f64(secs)));
            return;
        }
        if call(stmt, "plot").is_some() || call(stmt, "hist").is_some() {
            effects.push(Effect::Plot);
            return;
        }
        if call(stmt, "kable").is_some() {
            effects.push(Effect::Html(TABLE_HTML.to_string()));
            return;
        }
        if let Some((name, expr)) = stmt.split_once("<-") {
            match self.value(expr) {
                Ok(v) => {
                    self.vars.insert(name.trim().to_string(), v);
                }
                Err(e) => effects.push(Effect::Error(e)),
            }
            return;
        }
        if let Some((name, _)) = stmt.split_once('(') {
            effects.push(Effect::Error(format!("could not find function \"{}\"", name.trim())));
            return;
        }
        match self.value(stmt) {
            Ok(v) => effects.push(Effect::Out(format!("[1] {v}\n"))),
            Err(e) => effects.push(Effect::Error(e)),
        }
    }

    fn value(&self, expr: &str) -> Result<String, String> {
        let expr = expr.trim();
        if expr.starts_with('"') {
            return Ok(format!("\"{}\"", unquote(expr)));
        }
        if expr == "TRUE" || expr == "FALSE" || expr.parse::<f64>().is_ok() {
            return Ok(expr.to_string());
        }
        self.vars
            .get(expr)
            .cloned()
            .ok_or_else(|| format!("object '{expr}' not found"))
    }
}

/// `name(args)` -> `args`.
fn call<'a>(stmt: &'a str, name: &str) -> Option<&'a str> {
    stmt.strip_prefix(name)?.strip_prefix('(')?.strip_suffix(')')
}

/// Split a line at top-level semicolons.
fn split_statements(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => {
                out.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&line[start..]);
    out
}

/// Decode an R string literal.
fn unquote(lit: &str) -> String {
    let lit = lit.trim();
    let inner = lit
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(lit);
    let mut out = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('u') => {
                let hex: String = chars
                    .by_ref()
                    .skip_while(|&c| c == '{')
                    .take_while(|&c| c != '}')
                    .collect();
                if let Some(c) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(c);
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
