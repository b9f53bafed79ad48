use std::fs;
use std::path::Path;

/// Strip one trailing dot and lowercase; all outbound names use this form.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

/// Split a name into its DNS labels.
pub fn labels(name: &str) -> Vec<&str> {
    name.split('.').filter(|l| !l.is_empty()).collect()
}

/// Longest configured root domain that `name` belongs to, if any.
///
/// `sub_to_domain("a.b.example.com", ["example.com"])` is `"example.com"`.
pub fn sub_to_domain(name: &str, domains: &[String]) -> Option<String> {
    let name = normalize_name(name);
    let mut best: Option<&String> = None;
    for d in domains {
        if name == *d || name.ends_with(&format!(".{}", d)) {
            if best.map_or(true, |b| d.len() > b.len()) {
                best = Some(d);
            }
        }
    }
    best.cloned()
}

/// Read a newline-delimited wordlist, dropping blanks and comments.
pub fn read_wordlist(path: &Path) -> anyhow::Result<Vec<String>> {
    let data = fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in data.lines() {
        let word = line.trim().to_lowercase();
        if word.is_empty() || word.starts_with('#') {
            continue;
        }
        out.push(word);
    }
    Ok(out)
}

pub fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_dot() {
        assert_eq!(normalize_name("Mail.Example.COM."), "mail.example.com");
    }

    #[test]
    fn sub_to_domain_picks_longest_suffix() {
        let roots = vec!["example.com".to_string(), "sub.example.com".to_string()];
        assert_eq!(
            sub_to_domain("a.b.example.com", &roots).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            sub_to_domain("a.sub.example.com", &roots).as_deref(),
            Some("sub.example.com")
        );
        assert_eq!(sub_to_domain("example.org", &roots), None);
    }

    #[test]
    fn sub_to_domain_round_trip() {
        let roots = vec!["example.com".to_string()];
        assert_eq!(
            sub_to_domain("a.b.example.com", &roots).as_deref(),
            Some("example.com")
        );
        assert_eq!(
            sub_to_domain("example.com", &roots).as_deref(),
            Some("example.com")
        );
    }
}
