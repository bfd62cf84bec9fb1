//! Record to event mapping.

use std::path::Path;

use repl_bridge_core::{CorrelationId, EventKind, OutputEvent, Record, RecordType};

/// Media type for an image file, by extension.
#[must_use]
pub fn media_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => return None,
    })
}

/// Map a record to its caller-facing event.
///
/// Structural records yield nothing. Image files are read and then
/// removed; a missing or unreadable one is logged and dropped.
pub async fn classify(record: Record) -> Option<OutputEvent> {
    let Record { kind, id, content } = record;
    let text_kind = match kind {
        RecordType::CellStart | RecordType::CellEnd => return None,
        RecordType::Plot => return read_image(id, content.trim()).await,
        RecordType::Output => EventKind::Text,
        RecordType::Message => EventKind::Message,
        RecordType::Warning => EventKind::Warning,
        RecordType::Error => EventKind::Error,
        RecordType::Html => EventKind::Markup,
    };
    let content = content.trim_end_matches('\n');
    if text_kind == EventKind::Text && content.is_empty() {
        return None;
    }
    Some(OutputEvent::text(text_kind, id, content))
}

async fn read_image(id: CorrelationId, path: &str) -> Option<OutputEvent> {
    let path = Path::new(path);
    let media_type = media_type_for(path).unwrap_or("application/octet-stream");
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(request = %id, path = %path.display(), "Dropping unreadable plot: {e}");
            return None;
        }
    };
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), "Failed to remove plot file: {e}");
    }
    Some(OutputEvent::image(id, media_type, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: RecordType, content: &str) -> Record {
        Record::new(kind, CorrelationId::from_wire("r1"), content)
    }

    #[tokio::test]
    async fn test_direct_mapping() {
        let cases = [
            (RecordType::Output, EventKind::Text),
            (RecordType::Message, EventKind::Message),
            (RecordType::Warning, EventKind::Warning),
            (RecordType::Error, EventKind::Error),
            (RecordType::Html, EventKind::Markup),
        ];
        for (kind, expected) in cases {
            let event = classify(record(kind, "body\n")).await.unwrap();
            assert_eq!(event.kind, expected);
            assert_eq!(event.as_text(), Some("body"));
            assert_eq!(event.request_id.as_str(), "r1");
        }
    }

    #[tokio::test]
    async fn test_structural_and_empty_output_dropped() {
        assert!(classify(record(RecordType::CellStart, "")).await.is_none());
        assert!(classify(record(RecordType::CellEnd, "")).await.is_none());
        assert!(classify(record(RecordType::Output, "\n")).await.is_none());
    }

    #[tokio::test]
    async fn test_plot_is_read_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r1_001.png");
        let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        tokio::fs::write(&path, &bytes).await.unwrap();

        let event = classify(record(RecordType::Plot, &path.to_string_lossy()))
            .await
            .unwrap();
        assert_eq!(event.kind, EventKind::Image);
        assert_eq!(event.as_bytes(), Some(bytes.as_slice()));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_plot_dropped() {
        let event = classify(record(RecordType::Plot, "/nonexistent/plot.png")).await;
        assert!(event.is_none());
    }

    #[test]
    fn test_media_types() {
        assert_eq!(media_type_for(Path::new("a.PNG")), Some("image/png"));
        assert_eq!(media_type_for(Path::new("a.jpeg")), Some("image/jpeg"));
        assert_eq!(media_type_for(Path::new("a.svg")), Some("image/svg+xml"));
        assert_eq!(media_type_for(Path::new("a.pdf")), Some("application/pdf"));
        assert_eq!(media_type_for(Path::new("a")), None);
    }
}
