/// Organizational domain reduction and address helpers
pub struct DomainUtils;

impl DomainUtils {
    /// Reduce a hostname to its organizational (registrable) domain.
    ///
    /// `mail.example.com` becomes `example.com` and `anything.bbc.co.uk`
    /// becomes `bbc.co.uk`. Returns `None` for empty or malformed names,
    /// IP literals, and bare public suffixes. Applying it to its own output
    /// yields the same value.
    pub fn organizational_domain(hostname: &str) -> Option<String> {
        let host = Self::normalize_host(hostname)?;
        psl::domain_str(&host).map(|od| od.to_string())
    }

    /// Extract the host part from an envelope address.
    ///
    /// Accepts `<user@host>`, `user@host` and milter argument strings that
    /// still carry ESMTP parameters (`<user@host> SIZE=1234`). The null
    /// sender `<>` has no host.
    pub fn extract_host(address: &str) -> Option<String> {
        let address = address.trim();
        let address = match address.strip_prefix('<') {
            Some(rest) => rest.split('>').next()?,
            None => address.split_whitespace().next()?,
        };

        let at_pos = address.rfind('@')?;
        let host = address[at_pos + 1..]
            .split(|c: char| c == '>' || c == ',' || c == ';' || c.is_whitespace())
            .next()?
            .trim();

        if host.is_empty() {
            return None;
        }
        Some(host.to_lowercase())
    }

    /// Lowercase, drop a trailing root dot, and reject anything that cannot be a DNS name.
    fn normalize_host(hostname: &str) -> Option<String> {
        let host = hostname.trim().to_lowercase();
        let host = host.strip_suffix('.').unwrap_or(&host);

        if host.is_empty() || host.len() > 253 || host.starts_with('[') {
            return None;
        }
        if host.parse::<std::net::IpAddr>().is_ok() {
            return None;
        }
        if host.split('.').any(|label| label.is_empty() || label.len() > 63) {
            return None;
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
        {
            return None;
        }

        Some(host.to_string())
    }
}
