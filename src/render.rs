//! Rendering
//!
//! HTML for the response page, Telegram-flavoured HTML for chat replies and
//! the UTC/EDT timestamp formats shown to users.

use crate::responses::PublishedResponse;
use chrono::{DateTime, FixedOffset, Offset, TimeZone, Utc};
use pulldown_cmark::{html, Event, Options, Parser};
use std::time::Duration;

/// Telegram's message length limit
pub const TELEGRAM_MAX_MESSAGE: usize = 4096;

const FULL_RESPONSE_LINK_TEXT: &str = "View Formatted Response in its entirety";
const ELLIPSIS: &str = "...";

/// Fixed US Eastern daylight offset (UTC-4), shown next to UTC everywhere
fn edt() -> FixedOffset {
    FixedOffset::west_opt(4 * 3600).unwrap_or_else(|| Utc.fix())
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// RFC 1123 in UTC, e.g. `Wed, 01 May 2024 14:00:00 UTC`
pub fn format_utc(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S UTC").to_string()
}

/// RFC 1123 in fixed EDT (UTC-4), e.g. `Wed, 01 May 2024 10:00:00 EDT`
pub fn format_edt(at: DateTime<Utc>) -> String {
    edt()
        .from_utc_datetime(&at.naive_utc())
        .format("%a, %d %b %Y %H:%M:%S EDT")
        .to_string()
}

/// Remaining time as hours, minutes and seconds, e.g. `3h59m5s`
pub fn format_remaining(d: Duration) -> String {
    let secs = d.as_secs();
    let (hours, mins, secs) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m{}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Convert markdown code blocks to Telegram HTML format
///
/// Fenced blocks become `<pre><code>`, single backticks become `<code>`.
/// Everything is HTML-escaped and unclosed tags are closed at the end.
pub fn markdown_to_telegram_html(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 100);
    let mut chars = text.chars().peekable();
    let mut in_code_block = false;
    let mut in_inline_code = false;

    while let Some(c) = chars.next() {
        if c == '`' {
            if chars.peek() == Some(&'`') {
                chars.next();
                if chars.peek() == Some(&'`') {
                    chars.next();

                    if in_code_block {
                        result.push_str("</code></pre>");
                        in_code_block = false;
                    } else {
                        // Skip language identifier (```rust)
                        while let Some(&ch) = chars.peek() {
                            if ch == '\n' || ch == '\r' {
                                chars.next();
                                if ch == '\r' && chars.peek() == Some(&'\n') {
                                    chars.next();
                                }
                                break;
                            } else if ch.is_alphanumeric() || ch == '_' || ch == '-' || ch == '+' {
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        if in_inline_code {
                            result.push_str("</code>");
                            in_inline_code = false;
                        }
                        result.push_str("<pre><code>");
                        in_code_block = true;
                    }
                    continue;
                }
                // Two backticks: empty inline code, emit nothing
                if !in_code_block {
                    continue;
                }
                result.push_str("``");
                continue;
            }

            if !in_code_block {
                result.push_str(if in_inline_code { "</code>" } else { "<code>" });
                in_inline_code = !in_inline_code;
                continue;
            }
        }

        match c {
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '&' => result.push_str("&amp;"),
            _ => result.push(c),
        }
    }

    if in_inline_code {
        result.push_str("</code>");
    }
    if in_code_block {
        result.push_str("</code></pre>");
    }

    result
}

/// Length as Telegram counts it (UTF-16 code units)
fn telegram_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Chat reply for an LLM response, always ending with a link to the full page
///
/// When the converted response does not fit next to the link, the response
/// is cut (on a char boundary of the markdown source, so tags stay balanced)
/// and suffixed with `...`.
pub fn telegram_reply(response: &str, link: &str) -> String {
    let footer = format!(
        "\n\n<a href=\"{}\">{}</a>",
        escape_html(link),
        FULL_RESPONSE_LINK_TEXT
    );
    let budget = TELEGRAM_MAX_MESSAGE.saturating_sub(telegram_len(&footer));

    let body = markdown_to_telegram_html(response);
    if telegram_len(&body) <= budget {
        return format!("{}{}", body, footer);
    }

    let room = budget.saturating_sub(ELLIPSIS.len());
    let chars: Vec<char> = response.chars().collect();
    let mut keep = chars.len().min(room);

    loop {
        let cut: String = chars[..keep].iter().collect();
        let body = markdown_to_telegram_html(&cut);
        if telegram_len(&body) <= room || keep == 0 {
            return format!("{}{}{}", body, ELLIPSIS, footer);
        }
        // Escapes and tags grow the text; shrink by the overshoot
        let over = telegram_len(&body) - room;
        keep = keep.saturating_sub(over.max(1));
    }
}

/// Markdown to HTML with raw HTML in the source shown as text
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let parser = Parser::new_ext(markdown, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

const PAGE_TITLE: &str = "KernelSanders is finger lickin' good :)";

const PAGE_STYLE: &str = r#"
        body { font-family: Arial, sans-serif; margin: 20px; background-color: #121212; color: #e0e0e0; }
        h1 { color: #bb86fc; }
        .container { background-color: #1e1e1e; padding: 20px; border-radius: 5px; box-shadow: 0 2px 4px rgba(255,255,255,0.1); }
        pre { background-color: #2c2c2c; padding: 10px; border-radius: 3px; overflow-x: auto; }
        code { background-color: #2c2c2c; padding: 2px 4px; border-radius: 3px; }
        table { border-collapse: collapse; }
        th, td { border: 1px solid #444; padding: 4px 8px; }
        .note { font-style: italic; color: #a0a0a0; }
        .view-raw-button { margin-top: 10px; padding: 5px 10px; background-color: #bb86fc; color: #121212; border: none; border-radius: 3px; cursor: pointer; }
"#;

const PAGE_SCRIPT: &str = r#"
        function toggleRaw() {
            var raw = document.getElementById("raw-content");
            raw.style.display = raw.style.display === "none" ? "block" : "none";
        }
"#;

/// Full HTML page for a published response
pub fn response_page(record: &PublishedResponse, now: DateTime<Utc>) -> String {
    let remaining = crate::clock::until(now, record.expires_at);

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{title}</title>
    <style>{style}</style>
    <script>{script}</script>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
        <p><strong>Created At:</strong> UTC: {created_utc} | EDT: {created_edt}</p>
        <p><strong>Deletion Time:</strong> UTC: {expires_utc} | EDT: {expires_edt}</p>
        <p><strong>Time Remaining:</strong> {remaining}</p>
        <button class="view-raw-button" onclick="toggleRaw()">View RAW</button>
        <hr>
        <div id="formatted-content">{formatted}</div>
        <div id="raw-content" style="display:none;">
            <pre><code>{raw}</code></pre>
        </div>
        <p class="note">Please save this content elsewhere as it will expire soon.</p>
        <p class="note">To keep this response, copy the RAW view or use your browser's save functionality.</p>
    </div>
</body>
</html>
"#,
        title = escape_html(PAGE_TITLE),
        style = PAGE_STYLE,
        script = PAGE_SCRIPT,
        created_utc = format_utc(record.created_at),
        created_edt = format_edt(record.created_at),
        expires_utc = format_utc(record.expires_at),
        expires_edt = format_edt(record.expires_at),
        remaining = format_remaining(remaining),
        formatted = markdown_to_html(&record.content),
        raw = escape_html(&record.content),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<b>&\"'"), "&lt;b&gt;&amp;&#34;&#39;");
    }

    #[test]
    fn test_utc_and_edt_formats() {
        let t = at("2024-05-01T14:00:00Z");
        assert_eq!(format_utc(t), "Wed, 01 May 2024 14:00:00 UTC");
        assert_eq!(format_edt(t), "Wed, 01 May 2024 10:00:00 EDT");
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(Duration::from_secs(4 * 3600)), "4h0m0s");
        assert_eq!(format_remaining(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_remaining(Duration::ZERO), "0s");
    }

    #[test]
    fn test_markdown_to_telegram_html() {
        let html = markdown_to_telegram_html("Use `Vec<u8>`:\n```rust\nlet x = a && b;\n```");
        assert_eq!(
            html,
            "Use <code>Vec&lt;u8&gt;</code>:\n<pre><code>let x = a &amp;&amp; b;\n</code></pre>"
        );
    }

    #[test]
    fn test_markdown_to_telegram_html_closes_open_block() {
        assert_eq!(markdown_to_telegram_html("```\nfn"), "<pre><code>fn</code></pre>");
    }

    #[test]
    fn test_short_reply_keeps_whole_response() {
        let reply = telegram_reply("Hello <world>", "http://localhost:8080/abc");
        assert_eq!(
            reply,
            "Hello &lt;world&gt;\n\n<a href=\"http://localhost:8080/abc\">View Formatted Response in its entirety</a>"
        );
    }

    #[test]
    fn test_long_reply_is_truncated_to_limit() {
        let long = "<&>".repeat(3000);
        let reply = telegram_reply(&long, "http://localhost:8080/abc");
        assert!(telegram_len(&reply) <= TELEGRAM_MAX_MESSAGE);
        assert!(reply.contains("...\n\n<a href="));
        assert!(!reply.contains("&am...") && !reply.contains("&l..."));
    }

    #[test]
    fn test_truncated_code_block_stays_balanced() {
        let long = format!("```\n{}\n```", "x".repeat(5000));
        let reply = telegram_reply(&long, "http://localhost:8080/abc");
        assert!(telegram_len(&reply) <= TELEGRAM_MAX_MESSAGE);
        assert_eq!(reply.matches("<pre>").count(), reply.matches("</pre>").count());
    }

    #[test]
    fn test_markdown_raw_html_is_escaped() {
        let html = markdown_to_html("# Title\n\n<script>alert(1)</script>\n\nsome *em*");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("<em>em</em>"));
    }

    #[test]
    fn test_response_page() {
        let created = at("2024-05-01T14:00:00Z");
        let record = PublishedResponse {
            id: "id".to_string(),
            content: "**bold** <i>raw</i>".to_string(),
            owner_id: Some(1),
            created_at: created,
            expires_at: created + chrono::Duration::hours(4),
        };
        let page = response_page(&record, created + chrono::Duration::minutes(30));

        assert!(page.contains("UTC: Wed, 01 May 2024 14:00:00 UTC"));
        assert!(page.contains("EDT: Wed, 01 May 2024 10:00:00 EDT"));
        assert!(page.contains("3h30m0s"));
        assert!(page.contains("<strong>bold</strong>"));
        assert!(page.contains("View RAW"));
        assert!(page.contains("&lt;i&gt;raw&lt;/i&gt;"));
    }
}
