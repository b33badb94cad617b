use regex::Regex;

/// Reads verification verdicts from `Authentication-Results` headers.
///
/// Only headers stamped by the configured authserv-id are trusted; anything
/// else may have been written by the sender. The MTA must still strip
/// inbound headers carrying that id, since a forged one looks identical.
pub struct AuthResultsReader {
    authserv_id: Option<String>,
    dkim_pass: Regex,
    header_d: Regex,
    header_i: Regex,
}

impl AuthResultsReader {
    pub fn new(authserv_id: Option<&str>) -> anyhow::Result<Self> {
        Ok(AuthResultsReader {
            authserv_id: authserv_id.map(|id| id.to_lowercase()),
            dkim_pass: Regex::new(r"(?i)^dkim\s*=\s*pass\b")?,
            header_d: Regex::new(r#"(?i)\bheader\.d\s*=\s*"?([a-z0-9._-]+)"#)?,
            header_i: Regex::new(r#"(?i)\bheader\.i\s*=\s*"?[^@\s;"]*@([a-z0-9._-]+)"#)?,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.authserv_id.is_some()
    }

    /// Signing domains of every passing DKIM result in a trusted header.
    ///
    /// `None` when the header was not stamped by the trusted authserv-id,
    /// `Some` (possibly empty) when it was.
    pub fn dkim_pass_domains(&self, header_value: &str) -> Option<Vec<String>> {
        let trusted_id = self.authserv_id.as_deref()?;

        let header = strip_comments(header_value);
        let mut resinfos = header.split(';');
        let authserv_id = resinfos
            .next()
            .and_then(|first| first.split_whitespace().next())
            .map(|id| id.to_lowercase());
        if authserv_id.as_deref() != Some(trusted_id) {
            log::debug!("ignoring Authentication-Results from {authserv_id:?}");
            return None;
        }

        let domains = resinfos
            .map(str::trim)
            .filter(|resinfo| self.dkim_pass.is_match(resinfo))
            .filter_map(|resinfo| {
                self.header_d
                    .captures(resinfo)
                    .or_else(|| self.header_i.captures(resinfo))
                    .map(|caps| caps[1].to_lowercase())
            })
            .collect();
        Some(domains)
    }
}

/// Drop RFC 5322 comments, nested ones included. Quoted strings are kept as-is.
fn strip_comments(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut depth = 0usize;
    let mut quoted = false;
    let mut escaped = false;

    for c in value.chars() {
        if escaped {
            escaped = false;
            if depth == 0 {
                out.push(c);
            }
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                if depth == 0 {
                    out.push(c);
                }
            }
            '"' if depth == 0 => {
                quoted = !quoted;
                out.push(c);
            }
            '(' if !quoted => {
                depth += 1;
                if depth == 1 {
                    out.push(' ');
                }
            }
            ')' if !quoted && depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}
