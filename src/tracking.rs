use uuid::Uuid;

/// 1x1 transparent GIF served for open-tracking pixels.
pub const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xFF, 0xFF, 0xFF, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
];

/// Opaque per-send identifier embedded in pixel and click URLs.
pub fn new_tracking_hash() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn pixel_url(base: &str, hash: &str) -> String {
    format!("{}/api/track/{}.png", base.trim_end_matches('/'), hash)
}

pub fn click_url(base: &str, hash: &str, link_id: Uuid) -> String {
    format!(
        "{}/api/track/{}/click?lid={}",
        base.trim_end_matches('/'),
        hash,
        link_id
    )
}

/// An outbound link discovered during rewriting, keyed by the id embedded
/// in the replacement URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenLink {
    pub id: Uuid,
    pub original_url: String,
}

/// Rewrite every outbound `<a href>` to the click-through redirect and
/// append the open pixel. Returns the tracked HTML alongside the links
/// that need `tracked_links` rows.
pub fn instrument_html(html: &str, base: &str, hash: &str) -> (String, Vec<RewrittenLink>) {
    let (rewritten, links) = rewrite_links(html, base, hash);
    (append_pixel(&rewritten, base, hash), links)
}

pub fn rewrite_links(html: &str, base: &str, hash: &str) -> (String, Vec<RewrittenLink>) {
    let mut output = String::with_capacity(html.len());
    let mut links = Vec::new();
    let mut rest = html;

    while let Some(found) = find_href(rest) {
        let (prefix, quote, after_quote) = found;
        output.push_str(prefix);
        output.push_str("href=");
        output.push(quote);

        match after_quote.find(quote) {
            Some(end) => {
                let url = &after_quote[..end];
                if is_outbound(url) {
                    let link = RewrittenLink {
                        id: Uuid::new_v4(),
                        original_url: url.to_string(),
                    };
                    output.push_str(&click_url(base, hash, link.id));
                    links.push(link);
                } else {
                    output.push_str(url);
                }
                output.push(quote);
                rest = &after_quote[end + 1..];
            }
            None => {
                // Unterminated attribute; emit the tail untouched.
                output.push_str(after_quote);
                rest = "";
            }
        }
    }
    output.push_str(rest);

    (output, links)
}

pub fn append_pixel(html: &str, base: &str, hash: &str) -> String {
    let pixel = format!(
        "<img src=\"{}\" width=\"1\" height=\"1\" style=\"display:none\" alt=\"\"/>",
        pixel_url(base, hash)
    );
    match html.rfind("</body>") {
        Some(index) => {
            let mut output = String::with_capacity(html.len() + pixel.len());
            output.push_str(&html[..index]);
            output.push_str(&pixel);
            output.push_str(&html[index..]);
            output
        }
        None => format!("{html}{pixel}"),
    }
}

fn is_outbound(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Locate the next `href=` attribute; returns the text before it, the quote
/// character, and the remainder after the opening quote.
fn find_href(html: &str) -> Option<(&str, char, &str)> {
    let mut offset = 0;
    loop {
        let index = html[offset..].find("href=")? + offset;
        let after = &html[index + "href=".len()..];
        let quote = after.chars().next()?;
        if quote == '"' || quote == '\'' {
            return Some((&html[..index], quote, &after[1..]));
        }
        offset = index + "href=".len();
    }
}
