//! GNU R instrumentation.

use std::{fmt::Write as _, path::Path, sync::LazyLock};

use regex::Regex;
use repl_bridge_core::{CaptureMode, ChannelPreference, CorrelationId, Language, SessionContext};

use super::{Dialect, Prompts, SetupInjection};
use crate::{channel::ScrapeMarkers, command::InterpreterCommand};

const HELPERS: &str = include_str!("r_helpers.R");

/// Longest string literal placed on one input line. R's console
/// truncates lines past 4096 bytes.
const MAX_PIECE_LEN: usize = 400;

static IMAGE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:plot|hist|barplot|boxplot|ggplot|image|pairs|curve|pie)\s*\(")
        .expect("valid regex")
});

static MARKUP_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:kable|kbl|datatable|htmlTable|gt|HTML)\s*\(|\btags\$").expect("valid regex")
});

static ERROR_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Error(?: in .+? :|:)(?: |$)").expect("valid regex"));

/// R dialect.
#[derive(Debug, Default, Clone)]
pub struct RDialect;

impl RDialect {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Dialect for RDialect {
    fn language(&self) -> Language {
        Language::R
    }

    fn command(&self) -> InterpreterCommand {
        InterpreterCommand::new("R")
            .args(["--no-save", "--no-restore", "--quiet", "--interactive"])
            .env("NO_COLOR", "1")
    }

    fn prompts(&self) -> Prompts {
        Prompts {
            primary: "> ".into(),
            continuation: "+ ".into(),
        }
    }

    fn setup(&self, ctx: &SessionContext) -> SetupInjection {
        let side_log = if ctx.channel == ChannelPreference::Scrape {
            "FALSE"
        } else {
            "TRUE"
        };
        let script = HELPERS
            .replace("@@NS@@", &ctx.namespace)
            .replace("@@LOG@@", &path_literal(&ctx.side_log))
            .replace("@@PLOT_DIR@@", &path_literal(&ctx.plot_dir))
            .replace("@@READY@@", &path_literal(&ctx.ready_file))
            .replace("@@TOKEN@@", &string_literal(&ctx.ready_token))
            .replace("@@SIDELOG@@", side_log);
        let file = ctx.state_dir.join("setup.R");
        let line = format!("source({})\n", path_literal(&file));
        SetupInjection { file, script, line }
    }

    fn encode_side_log(
        &self,
        ctx: &SessionContext,
        id: &CorrelationId,
        code: &str,
        mode: Option<CaptureMode>,
    ) -> String {
        let mode = mode.map_or("auto", CaptureMode::as_str);
        let mut out = format!(
            ".{}$run({}, {}, c(\n",
            ctx.namespace,
            string_literal(id.as_str()),
            string_literal(mode)
        );
        let pieces = split_pieces(code);
        for (i, piece) in pieces.iter().enumerate() {
            out.push_str(piece);
            out.push_str(if i + 1 < pieces.len() { ",\n" } else { "\n" });
        }
        out.push_str("))\n");
        out
    }

    fn encode_scrape(
        &self,
        ctx: &SessionContext,
        id: &CorrelationId,
        code: &str,
        mode: CaptureMode,
    ) -> String {
        let ns = &ctx.namespace;
        let code = code.trim_end_matches(['\n', '\r']);
        let mut out = String::new();
        let _ = writeln!(out, ".{ns}_s_{id} <- TRUE");
        match mode {
            CaptureMode::Plain => {
                let _ = writeln!(out, "{code}");
            }
            CaptureMode::Image => {
                let _ = writeln!(out, ".{ns}_capture_plot({{\n{code}\n}})");
            }
            CaptureMode::Markup => {
                let _ = writeln!(out, ".{ns}_capture_html({{\n{code}\n}})");
            }
        }
        let _ = writeln!(out, ".{ns}_e_{id} <- TRUE; rm(.{ns}_s_{id}, .{ns}_e_{id})");
        out
    }

    fn scrape_markers(&self, ctx: &SessionContext, id: &CorrelationId) -> ScrapeMarkers {
        let ns = &ctx.namespace;
        ScrapeMarkers {
            start_sentinel: format!(".{ns}_s_{id}"),
            end_sentinel: format!(".{ns}_e_{id}"),
            wrapper_prefixes: vec![
                format!(".{ns}_capture_plot("),
                format!(".{ns}_capture_html("),
            ],
            plot_open: format!("###{ns}_PLOT###"),
            plot_close: "###END_PLOT###".into(),
            html_open: format!("###{ns}_HTML_START###"),
            html_close: format!("###{ns}_HTML_END###"),
            prompts: self.prompts(),
            error_prefix: ERROR_PREFIX.clone(),
            warning_prefixes: vec![
                "Warning message".into(),
                "In addition: Warning message".into(),
            ],
        }
    }

    fn infer_capture(&self, code: &str) -> CaptureMode {
        if IMAGE_CALL.is_match(code) {
            CaptureMode::Image
        } else if MARKUP_CALL.is_match(code) {
            CaptureMode::Markup
        } else {
            CaptureMode::Plain
        }
    }
}

/// Quote `s` as an R string literal.
#[must_use]
pub fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        push_escaped(&mut out, c);
    }
    out.push('"');
    out
}

fn path_literal(path: &Path) -> String {
    string_literal(&path.to_string_lossy())
}

fn push_escaped(out: &mut String, c: char) {
    match c {
        '\\' => out.push_str("\\\\"),
        '"' => out.push_str("\\\""),
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        c if c.is_control() => {
            let _ = write!(out, "\\u{{{:04x}}}", u32::from(c));
        }
        c => out.push(c),
    }
}

/// Split `code` into quoted literals, each short enough for one console line.
fn split_pieces(code: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::from("\"");
    for c in code.chars() {
        let before = current.len();
        push_escaped(&mut current, c);
        if current.len() >= MAX_PIECE_LEN {
            let escaped = current.split_off(before);
            current.push('"');
            pieces.push(std::mem::replace(&mut current, format!("\"{escaped}")));
        }
    }
    current.push('"');
    pieces.push(current);
    pieces
}
