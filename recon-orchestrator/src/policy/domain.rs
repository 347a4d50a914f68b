//! Domain allow/deny pattern matching
//!
//! Plain patterns match the domain and its subdomains (`example.com` matches
//! `example.com` and `api.example.com`). Patterns with `*` or `?` are globs
//! over the whole host name (`*.example.com` matches subdomains only).

/// Returns true if `host` matches `pattern`
pub fn matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();

    if pattern.contains('*') || pattern.contains('?') {
        return glob(pattern.as_bytes(), host.as_bytes());
    }

    host == pattern || host.ends_with(&format!(".{}", pattern))
}

pub fn first_match<'a>(patterns: &'a [String], host: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|p| matches(p, host))
        .map(String::as_str)
}

/// Wildcard match with backtracking over the last `*`
fn glob(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}
