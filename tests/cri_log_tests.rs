//! Tests for the CRI log file parsers.
//!
//! Covers the CRI text format (partial/full tags), the Docker JSON format,
//! format auto-detection, malformed-line skipping, and the since filter.

use chrono::{DateTime, Utc};
use std::io::Cursor;
use unirun::logging::{IOStream, LogReader};
use unirun::runtimes::cri::CriLogReader;
use unirun::Error;

const LOG_TIME: &str = "2024-02-12T10:30:00.123456789Z";

fn log_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(LOG_TIME)
        .unwrap()
        .with_timezone(&Utc)
}

fn reader(content: &str) -> CriLogReader<Cursor<Vec<u8>>> {
    CriLogReader::new(Cursor::new(content.as_bytes().to_vec()), None)
}

fn reader_since(content: &str, since: DateTime<Utc>) -> CriLogReader<Cursor<Vec<u8>>> {
    CriLogReader::new(Cursor::new(content.as_bytes().to_vec()), Some(since))
}

// =============================================================================
// Stream Framing
// =============================================================================

#[tokio::test]
async fn test_empty_log_is_eof() {
    let mut r = reader("");
    assert!(r.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_line_ending_is_unexpected_eof() {
    let mut r = reader("no line ending!");
    assert!(matches!(
        r.read_message().await,
        Err(Error::UnexpectedEof)
    ));
}

#[tokio::test]
async fn test_unknown_format_fails() {
    let mut r = reader("foobar\n");
    match r.read_message().await {
        Err(Error::MalformedStream(msg)) => {
            assert!(msg.starts_with("unsupported log format"), "{msg}");
        }
        other => panic!("expected malformed stream, got {other:?}"),
    }
}

// =============================================================================
// CRI Text Format
// =============================================================================

#[tokio::test]
async fn test_cri_empty_partial_line() {
    let mut r = reader(&format!("{LOG_TIME} stdout P \n"));
    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.stream, IOStream::Stdout);
    assert_eq!(msg.time, log_time());
    assert_eq!(msg.text, "");
}

#[tokio::test]
async fn test_cri_partial_and_full_lines() {
    let content = format!(
        "{LOG_TIME} stdout P First one thing...\n\
         {LOG_TIME} stdout F  and then another\n\
         {LOG_TIME} stderr F This is an error\n"
    );
    let mut r = reader(&content);

    // The partial line loses the format's newline; the full lines keep it.
    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.stream, IOStream::Stdout);
    assert_eq!(msg.text, "First one thing...");

    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.stream, IOStream::Stdout);
    assert_eq!(msg.text, " and then another\n");

    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.stream, IOStream::Stderr);
    assert_eq!(msg.text, "This is an error\n");

    assert!(r.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cri_sub_tags() {
    let mut r = reader(&format!("{LOG_TIME} stdout P:first trailing\n"));
    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.text, "trailing");
}

#[tokio::test]
async fn test_cri_unknown_stream_is_skipped() {
    // The first line selects the CRI format; the bad stream token on the
    // second line fails that one line, not the reader.
    let content = format!(
        "{LOG_TIME} stdout F fine\n\
         {LOG_TIME} stdmisc F dropped\n\
         {LOG_TIME} stderr F also fine\n"
    );
    let mut r = reader(&content);

    assert_eq!(r.read_message().await.unwrap().unwrap().text, "fine\n");
    assert_eq!(r.read_message().await.unwrap().unwrap().text, "also fine\n");
    assert!(r.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cri_since_filter() {
    let early = "2024-02-12T10:29:59Z";
    let content = format!(
        "{early} stdout F This should be skipped.\n\
         {LOG_TIME} stdout F This is the first message.\n"
    );
    let mut r = reader_since(&content, log_time());

    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.text, "This is the first message.\n");
    assert_eq!(msg.time, log_time());
    assert!(r.read_message().await.unwrap().is_none());
}

// =============================================================================
// Docker JSON Format
// =============================================================================

#[tokio::test]
async fn test_json_defaults_to_stdout() {
    let mut r = reader(&format!("{{\"time\":\"{LOG_TIME}\"}}\n"));
    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.stream, IOStream::Stdout);
    assert_eq!(msg.time, log_time());
    assert_eq!(msg.text, "");
}

#[tokio::test]
async fn test_json_multiple_lines() {
    let content = format!(
        "{{\"time\":\"{LOG_TIME}\",\"stream\":\"stdout\",\"log\":\"First one thing...\"}}\n\
         {{\"time\":\"{LOG_TIME}\",\"stream\":\"stdout\",\"log\":\" and then another\\n\"}}\n\
         {{\"time\":\"{LOG_TIME}\",\"stream\":\"stderr\",\"log\":\"This is an error\\n\"}}\n"
    );
    let mut r = reader(&content);

    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.stream, IOStream::Stdout);
    assert_eq!(msg.text, "First one thing...");

    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.text, " and then another\n");

    let msg = r.read_message().await.unwrap().unwrap();
    assert_eq!(msg.stream, IOStream::Stderr);
    assert_eq!(msg.text, "This is an error\n");

    assert!(r.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn test_json_since_filter() {
    let early = "2024-02-12T10:29:59Z";
    let content = format!(
        "{{\"time\":\"{early}\",\"stream\":\"stdout\",\"log\":\"old\\n\"}}\n\
         {{\"time\":\"{LOG_TIME}\",\"stream\":\"stdout\",\"log\":\"new\\n\"}}\n"
    );
    let mut r = reader_since(&content, log_time());

    assert_eq!(r.read_message().await.unwrap().unwrap().text, "new\n");
    assert!(r.read_message().await.unwrap().is_none());
}

// =============================================================================
// Format Detection
// =============================================================================

#[tokio::test]
async fn test_detection_is_sticky() {
    // Once the JSON format is selected, a line that would parse as CRI text
    // is treated as a malformed JSON line and skipped.
    let content = format!(
        "{{\"time\":\"{LOG_TIME}\",\"log\":\"json line\\n\"}}\n\
         {LOG_TIME} stdout F cri line\n\
         {{\"time\":\"{LOG_TIME}\",\"log\":\"json again\\n\"}}\n"
    );
    let mut r = reader(&content);

    assert_eq!(r.read_message().await.unwrap().unwrap().text, "json line\n");
    assert_eq!(r.read_message().await.unwrap().unwrap().text, "json again\n");
    assert!(r.read_message().await.unwrap().is_none());
}

#[tokio::test]
async fn test_time_monotonicity_across_formats() {
    for content in [
        format!(
            "2024-02-12T10:30:00Z stdout F a\n\
             2024-02-12T10:30:00.5Z stdout F b\n\
             2024-02-12T10:30:01Z stderr F c\n"
        ),
        format!(
            "{{\"time\":\"2024-02-12T10:30:00Z\",\"log\":\"a\\n\"}}\n\
             {{\"time\":\"2024-02-12T10:30:00.5Z\",\"log\":\"b\\n\"}}\n\
             {{\"time\":\"2024-02-12T10:30:01Z\",\"log\":\"c\\n\"}}\n"
        ),
    ] {
        let mut r = reader(&content);
        let mut last = None;
        while let Some(msg) = r.read_message().await.unwrap() {
            if let Some(prev) = last {
                assert!(msg.time >= prev);
            }
            last = Some(msg.time);
        }
        assert!(last.is_some());
    }
}

// =============================================================================
// File-Backed Reads
// =============================================================================

#[tokio::test]
async fn test_reads_from_disk() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{LOG_TIME} stdout F from disk\n").unwrap();
    file.flush().unwrap();

    let opened = tokio::fs::File::open(file.path()).await.unwrap();
    let mut r = CriLogReader::new(opened, None);
    assert_eq!(r.read_message().await.unwrap().unwrap().text, "from disk\n");
    assert!(r.read_message().await.unwrap().is_none());
}
