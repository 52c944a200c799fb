//! Email cleanup before analysis.
//!
//! Strips HTML markup and entities, quoted replies, forwarded headers and
//! signatures, then normalizes whitespace. Pure and deterministic.

use std::sync::LazyLock;

use regex::Regex;

static SCRIPT_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>|<!--.*?-->")
        .expect("static pattern")
});

static BLOCK_BREAKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|li|tr|h[1-6]|blockquote)\s*>").expect("static pattern")
});

static TAGS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[a-zA-Z!][^>]*>").expect("static pattern"));

static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("static pattern"));

// "On Tue, 3 Mar 2026 at 10:02, Dana <dana@example.com> wrote:"
static REPLY_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^on\s.+\swrote:?$").expect("static pattern"));

static ORIGINAL_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^-{2,}\s*original message\s*-{2,}$").expect("static pattern")
});

static FORWARD_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^-{2,}\s*forwarded message\s*-{2,}$|^begin forwarded message:?$")
        .expect("static pattern")
});

static HEADER_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(from|sent|date|to|cc|bcc|subject|reply-to):\s").expect("static pattern")
});

static MOBILE_FOOTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^sent from my\s").expect("static pattern"));

static SPACES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("static pattern"));

const SIGN_OFFS: &[&str] = &[
    "best",
    "best regards",
    "best wishes",
    "regards",
    "kind regards",
    "warm regards",
    "many thanks",
    "thanks",
    "thank you",
    "thanks in advance",
    "cheers",
    "sincerely",
    "yours sincerely",
    "yours truly",
    "all the best",
];

/// Clean a raw message body for the language model.
pub fn preprocess(raw: &str) -> String {
    let text = strip_html(raw);

    let mut kept: Vec<String> = Vec::new();
    let mut in_forward_headers = false;
    for line in text.lines() {
        let line = SPACES.replace_all(line, " ");
        let trimmed = line.trim();

        if in_forward_headers {
            if HEADER_LINE.is_match(trimmed) {
                continue;
            }
            in_forward_headers = false;
        }

        if trimmed.starts_with('>') {
            continue;
        }
        if REPLY_HEADER.is_match(trimmed) || ORIGINAL_MESSAGE.is_match(trimmed) {
            break;
        }
        if FORWARD_MARKER.is_match(trimmed) {
            in_forward_headers = true;
            continue;
        }
        if is_signature_start(&line, trimmed) {
            break;
        }
        kept.push(trimmed.to_string());
    }

    collapse_blank_lines(&kept)
}

fn strip_html(raw: &str) -> String {
    let text = raw.replace("\r\n", "\n");
    if !text.contains('<') && !text.contains('&') {
        return text;
    }
    let text = SCRIPT_BLOCKS.replace_all(&text, "");
    let text = BLOCK_BREAKS.replace_all(&text, "\n");
    let text = TAGS.replace_all(&text, "");
    decode_entities(&text)
}

fn decode_entities(text: &str) -> String {
    let text = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures<'_>| {
        let body = &caps[1];
        let code = match body.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => body.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    // &amp; last so "&amp;lt;" stays "&lt;"
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn is_signature_start(line: &str, trimmed: &str) -> bool {
    if line.trim_end_matches(['\r', '\n']) == "-- " || trimmed == "--" {
        return true;
    }
    if MOBILE_FOOTER.is_match(trimmed) {
        return true;
    }
    let bare = trimmed
        .trim_end_matches([',', '.', '!'])
        .trim()
        .to_lowercase();
    SIGN_OFFS.contains(&bare.as_str())
}

fn collapse_blank_lines(lines: &[String]) -> String {
    let mut out = String::new();
    let mut pending_blank = false;
    for line in lines {
        if line.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push_str(if pending_blank { "\n\n" } else { "\n" });
        }
        out.push_str(line);
        pending_blank = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(
            preprocess("Please send the Q3 report by Friday."),
            "Please send the Q3 report by Friday."
        );
    }

    #[test]
    fn strips_html_and_entities() {
        let raw = "<html><head><style>p { color: red; }</style></head><body>\
                   <p>Invoice&nbsp;#42 is due</p><p>Amount: &lt;$300&gt; &amp; fees&#33;</p>\
                   </body></html>";
        assert_eq!(preprocess(raw), "Invoice #42 is due\nAmount: <$300> & fees!");
    }

    #[test]
    fn drops_quoted_replies() {
        let raw = "Sounds good, I'll book the room.\n\n\
                   On Mon, 2 Mar 2026 at 09:15, Dana <dana@example.com> wrote:\n\
                   > Can you book a room for Thursday?\n\
                   > Thanks";
        assert_eq!(preprocess(raw), "Sounds good, I'll book the room.");
    }

    #[test]
    fn drops_inline_quote_lines() {
        let raw = "> earlier text\nNew request: renew the domain\n> more quoted";
        assert_eq!(preprocess(raw), "New request: renew the domain");
    }

    #[test]
    fn drops_outlook_original_message() {
        let raw = "Approved.\n-----Original Message-----\nFrom: Finance\nPlease approve.";
        assert_eq!(preprocess(raw), "Approved.");
    }

    #[test]
    fn strips_forwarded_headers_but_keeps_body() {
        let raw = "FYI\n\n---------- Forwarded message ---------\n\
                   From: IRS <no-reply@irs.gov>\nDate: Mon, 2 Mar 2026\n\
                   Subject: Tax filing\nTo: me@example.com\n\n\
                   Your tax return is due April 15.";
        assert_eq!(preprocess(raw), "FYI\n\nYour tax return is due April 15.");
    }

    #[test]
    fn strips_signatures() {
        assert_eq!(
            preprocess("Pay the water bill.\n-- \nJohn Smith\nACME Corp"),
            "Pay the water bill."
        );
        assert_eq!(
            preprocess("Call the plumber today.\n\nSent from my iPhone"),
            "Call the plumber today."
        );
        assert_eq!(
            preprocess("Send the contract by Monday.\n\nBest regards,\nDana"),
            "Send the contract by Monday."
        );
    }

    #[test]
    fn normalizes_whitespace() {
        let raw = "  Line   one\t here \r\n\r\n\r\n\r\nLine two  ";
        assert_eq!(preprocess(raw), "Line one here\n\nLine two");
    }

    #[test]
    fn sign_off_words_inside_sentences_are_kept() {
        assert_eq!(
            preprocess("Thanks for the update, please file the report."),
            "Thanks for the update, please file the report."
        );
    }
}
