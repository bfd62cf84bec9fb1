//! Setup readiness detection.

use std::path::Path;

use repl_bridge_core::{ChannelKind, SessionContext};

/// Scans the stream for `###<NS>_READY:<channel>:<token>###`.
#[derive(Debug)]
pub struct ReadyScanner {
    side_log: String,
    scrape: String,
    buf: String,
}

impl ReadyScanner {
    #[must_use]
    pub fn new(ctx: &SessionContext) -> Self {
        let marker = |channel: &str| {
            format!("###{}_READY:{channel}:{}###", ctx.namespace, ctx.ready_token)
        };
        Self {
            side_log: marker("side_log"),
            scrape: marker("scrape"),
            buf: String::new(),
        }
    }

    /// Feed cleaned text; returns the channel the helper reported.
    pub fn push(&mut self, text: &str) -> Option<ChannelKind> {
        self.buf.push_str(text);
        let found = if self.buf.contains(&self.side_log) {
            Some(ChannelKind::SideLog)
        } else if self.buf.contains(&self.scrape) {
            Some(ChannelKind::Scrape)
        } else {
            None
        };

        let keep = self.side_log.len();
        if found.is_some() {
            self.buf.clear();
        } else if self.buf.len() > keep {
            let mut cut = self.buf.len() - keep;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
        found
    }
}

/// Whether the ready file holds `token`.
pub async fn ready_file_matches(path: &Path, token: &str) -> bool {
    tokio::fs::read_to_string(path)
        .await
        .is_ok_and(|content| content.trim() == token)
}

#[cfg(test)]
mod tests {
    use repl_bridge_core::{ChannelPreference, Language, SessionKey};

    use super::*;

    fn ctx(root: &Path) -> SessionContext {
        SessionContext::new(SessionKey::new(Language::R, root), root, ChannelPreference::Auto)
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let ctx = ctx(Path::new("/tmp/rb"));
        let mut scanner = ReadyScanner::new(&ctx);
        let marker = format!("###RB_READY:side_log:{}###\n", ctx.ready_token);
        let (a, b) = marker.split_at(10);
        assert_eq!(scanner.push("> source(\"/tmp/rb/setup.R\")\n"), None);
        assert_eq!(scanner.push(a), None);
        assert_eq!(scanner.push(b), Some(ChannelKind::SideLog));
    }

    #[test]
    fn test_wrong_token_or_echo_does_not_match() {
        let ctx = ctx(Path::new("/tmp/rb"));
        let mut scanner = ReadyScanner::new(&ctx);
        assert_eq!(scanner.push("###RB_READY:scrape:nottoken###\n"), None);
        let echo = format!("> cat(\"###\", \"RB_READY:\", channel, \":\", \"{}\", \"###\\n\")\n", ctx.ready_token);
        assert_eq!(scanner.push(&echo), None);
        let marker = format!("###RB_READY:scrape:{}###", ctx.ready_token);
        assert_eq!(scanner.push(&marker), Some(ChannelKind::Scrape));
    }

    #[test]
    fn test_buffer_stays_bounded() {
        let ctx = ctx(Path::new("/tmp/rb"));
        let mut scanner = ReadyScanner::new(&ctx);
        for _ in 0..1000 {
            scanner.push("some long banner line with ünïcode\n");
        }
        assert!(scanner.buf.len() <= scanner.side_log.len() + 4);
    }

    #[tokio::test]
    async fn test_ready_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        ctx.prepare().await.unwrap();
        assert!(!ready_file_matches(&ctx.ready_file, &ctx.ready_token).await);
        tokio::fs::write(&ctx.ready_file, "stale\n").await.unwrap();
        assert!(!ready_file_matches(&ctx.ready_file, &ctx.ready_token).await);
        tokio::fs::write(&ctx.ready_file, format!("{}\n", ctx.ready_token)).await.unwrap();
        assert!(ready_file_matches(&ctx.ready_file, &ctx.ready_token).await);
    }
}
