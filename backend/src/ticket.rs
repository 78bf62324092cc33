use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shareable proof of a completed draw, issued once when the commit lands.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub code: String,
    pub drawer: String,
    pub recipient: String,
    pub issued_at: u64,
}

impl Ticket {
    pub fn issue(drawer: impl Into<String>, recipient: impl Into<String>) -> Self {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            code: Uuid::new_v4().to_string(),
            drawer: drawer.into(),
            recipient: recipient.into(),
            issued_at,
        }
    }

    pub fn to_svg(&self) -> String {
        let short_code = self.code.split('-').next().unwrap_or(&self.code);
        format!(
            r##"<svg xmlns="http://www.w3.org/2000/svg" width="480" height="240" viewBox="0 0 480 240">
  <rect x="4" y="4" width="472" height="232" rx="18" fill="#b3202a" stroke="#f5d76e" stroke-width="6"/>
  <text x="240" y="58" text-anchor="middle" font-family="sans-serif" font-size="22" fill="#f5d76e">GIFT TICKET</text>
  <text x="240" y="108" text-anchor="middle" font-family="sans-serif" font-size="18" fill="#ffffff">{drawer} is giving a gift to</text>
  <text x="240" y="158" text-anchor="middle" font-family="sans-serif" font-size="34" font-weight="bold" fill="#ffffff">{recipient}</text>
  <text x="240" y="212" text-anchor="middle" font-family="monospace" font-size="14" fill="#f5d76e">#{code}</text>
</svg>
"##,
            drawer = escape_xml(&self.drawer),
            recipient = escape_xml(&self.recipient),
            code = short_code,
        )
    }
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
