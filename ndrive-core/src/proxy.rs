use std::sync::Arc;

use reqwest::{ClientBuilder, Proxy};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy setting: {0}")]
    Invalid(String),
    #[error("invalid proxy url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to fetch resolver script: {0}")]
    Fetch(#[from] reqwest::Error),
}

/// How outgoing requests reach the server.
#[derive(Debug, Clone, Default)]
pub enum ProxySettings {
    /// Honor the environment (`HTTPS_PROXY`, `NO_PROXY`, ...).
    #[default]
    System,
    /// Never use a proxy.
    Direct,
    Manual(Url),
    Automatic(Arc<PacScript>),
}

/// Parsed form of a `proxy` config value before any network access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxySpec {
    System,
    Direct,
    Manual(Url),
    Automatic(Url),
}

impl ProxySpec {
    pub fn parse(value: &str) -> Result<Self, ProxyError> {
        let value = value.trim();
        match value {
            "" | "system" => Ok(ProxySpec::System),
            "none" | "direct" => Ok(ProxySpec::Direct),
            other => {
                if let Some(url) = other.strip_prefix("manual:") {
                    Ok(ProxySpec::Manual(Url::parse(url)?))
                } else if let Some(url) = other.strip_prefix("pac:") {
                    Ok(ProxySpec::Automatic(Url::parse(url)?))
                } else {
                    Err(ProxyError::Invalid(other.to_string()))
                }
            }
        }
    }

    /// Resolves the proxy setting into usable settings, downloading the resolver script if needed.
    pub async fn resolve(self) -> Result<ProxySettings, ProxyError> {
        Ok(match self {
            ProxySpec::System => ProxySettings::System,
            ProxySpec::Direct => ProxySettings::Direct,
            ProxySpec::Manual(url) => ProxySettings::Manual(url),
            ProxySpec::Automatic(url) => {
                ProxySettings::Automatic(Arc::new(PacScript::fetch(url).await?))
            }
        })
    }
}

impl ProxySettings {
    pub(crate) fn apply(&self, builder: ClientBuilder) -> Result<ClientBuilder, ProxyError> {
        Ok(match self {
            ProxySettings::System => builder,
            ProxySettings::Direct => builder.no_proxy(),
            ProxySettings::Manual(url) => builder.proxy(
                Proxy::all(url.as_str()).map_err(|err| ProxyError::Invalid(err.to_string()))?,
            ),
            ProxySettings::Automatic(script) => {
                let script = Arc::clone(script);
                builder.proxy(Proxy::custom(move |target| script.proxy_for(target)))
            }
        })
    }
}

/// Minimal proxy auto-config evaluator.
///
/// The script is read as a list of `return "..."` statements, each
/// optionally guarded by the `if (...)` right before it. The first
/// statement whose guard holds decides: `DIRECT` means no proxy and
/// `PROXY host:port` selects an HTTP proxy. Guards may combine `||`, `&&`,
/// `!` and parentheses over `dnsDomainIs`, `shExpMatch`,
/// `isPlainHostName` and `localHostOrDomainIs`. A guard using anything
/// else (`isInNet`, `dnsResolve`, variables) never holds. No statement
/// matching means a direct connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacScript {
    rules: Vec<PacRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PacRule {
    guard: Option<PacCondition>,
    directives: Vec<PacDirective>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PacDirective {
    Direct,
    Proxy(Url),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PacCondition {
    Any(Vec<PacCondition>),
    All(Vec<PacCondition>),
    Not(Box<PacCondition>),
    DomainIs { subject: PacSubject, domain: String },
    ShellMatch { subject: PacSubject, pattern: String },
    PlainHost,
    LocalHostOrDomain(String),
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacSubject {
    Host,
    Url,
}

impl PacScript {
    pub async fn fetch(url: Url) -> Result<Self, ProxyError> {
        let body = reqwest::Client::builder()
            .no_proxy()
            .build()?
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(Self::parse(&body))
    }

    pub fn parse(source: &str) -> Self {
        let mut rules = Vec::new();
        let mut guard = None;
        let mut rest = source;
        while let Some((at, keyword)) = next_keyword(rest) {
            let after = &rest[at + keyword.len()..];
            if keyword == "if" {
                let Some((inner, tail)) = parenthesized(after) else {
                    break;
                };
                let condition = PacCondition::parse(inner);
                let tail_start = tail.trim_start().trim_start_matches('{').trim_start();
                // Only a return right after the guard is governed by it.
                let governs = next_keyword(tail_start)
                    .is_some_and(|(position, next)| position == 0 && next == "return");
                guard = Some(if governs {
                    condition
                } else {
                    PacCondition::Unsupported
                });
                rest = tail;
                continue;
            }
            let Some((literal, tail)) = string_literal(after) else {
                rest = after;
                guard = None;
                continue;
            };
            rules.push(PacRule {
                guard: guard.take(),
                directives: parse_directives(literal),
            });
            rest = tail;
        }
        Self { rules }
    }

    pub fn proxy_for(&self, target: &Url) -> Option<Url> {
        let host = target.host_str().unwrap_or_default().to_ascii_lowercase();
        let rule = self.rules.iter().find(|rule| {
            rule.guard
                .as_ref()
                .is_none_or(|guard| guard.holds(&host, target.as_str()))
        })?;
        match rule.directives.first()? {
            PacDirective::Direct => None,
            PacDirective::Proxy(url) => Some(url.clone()),
        }
    }
}

impl PacCondition {
    fn parse(source: &str) -> Self {
        let source = strip_parens(source.trim());
        let any = split_top_level(source, "||");
        if any.len() > 1 {
            return PacCondition::Any(any.into_iter().map(PacCondition::parse).collect());
        }
        let all = split_top_level(source, "&&");
        if all.len() > 1 {
            return PacCondition::All(all.into_iter().map(PacCondition::parse).collect());
        }
        if let Some(negated) = source.strip_prefix('!') {
            return PacCondition::Not(Box::new(PacCondition::parse(negated)));
        }
        Self::parse_call(source).unwrap_or(PacCondition::Unsupported)
    }

    fn parse_call(source: &str) -> Option<Self> {
        let open = source.find('(')?;
        let name = source[..open].trim();
        let (inner, tail) = parenthesized(&source[open..])?;
        if !tail.trim().is_empty() {
            return None;
        }
        let args = split_top_level(inner, ",");
        let subject = match args.first()?.trim() {
            "host" => PacSubject::Host,
            "url" => PacSubject::Url,
            _ => return None,
        };
        let text = || {
            let (literal, tail) = string_literal(args.get(1)?)?;
            tail.trim().is_empty().then(|| literal.to_string())
        };
        Some(match (name, args.len()) {
            ("dnsDomainIs", 2) => PacCondition::DomainIs {
                subject,
                domain: text()?.to_ascii_lowercase(),
            },
            ("shExpMatch", 2) => PacCondition::ShellMatch {
                subject,
                pattern: text()?,
            },
            ("isPlainHostName", 1) if subject == PacSubject::Host => PacCondition::PlainHost,
            ("localHostOrDomainIs", 2) if subject == PacSubject::Host => {
                PacCondition::LocalHostOrDomain(text()?.to_ascii_lowercase())
            }
            _ => return None,
        })
    }

    fn holds(&self, host: &str, url: &str) -> bool {
        let pick = |subject: PacSubject| match subject {
            PacSubject::Host => host,
            PacSubject::Url => url,
        };
        match self {
            PacCondition::Any(terms) => terms.iter().any(|term| term.holds(host, url)),
            PacCondition::All(terms) => terms.iter().all(|term| term.holds(host, url)),
            PacCondition::Not(term) => !term.holds(host, url),
            PacCondition::DomainIs { subject, domain } => {
                pick(*subject).to_ascii_lowercase().ends_with(domain.as_str())
            }
            PacCondition::ShellMatch { subject, pattern } => shell_match(pattern, pick(*subject)),
            PacCondition::PlainHost => !host.contains('.'),
            PacCondition::LocalHostOrDomain(full) => {
                host == full
                    || (!host.contains('.')
                        && full.strip_prefix(host).is_some_and(|rest| rest.starts_with('.')))
            }
            PacCondition::Unsupported => false,
        }
    }
}

fn parse_directives(literal: &str) -> Vec<PacDirective> {
    let mut directives = Vec::new();
    for entry in literal.split(';') {
        let entry = entry.trim();
        if entry.eq_ignore_ascii_case("DIRECT") {
            directives.push(PacDirective::Direct);
        } else if let Some(host) = entry
            .strip_prefix("PROXY ")
            .or_else(|| entry.strip_prefix("HTTP "))
            && let Ok(url) = Url::parse(&format!("http://{}", host.trim()))
        {
            directives.push(PacDirective::Proxy(url));
        }
    }
    directives
}

/// Position of the next `if` or `return` keyword outside string literals.
fn next_keyword(source: &str) -> Option<(usize, &'static str)> {
    let bytes = source.as_bytes();
    let mut quote = None;
    let mut at = 0;
    while at < bytes.len() {
        let byte = bytes[at];
        match quote {
            Some(q) if byte == q => quote = None,
            Some(_) => {}
            None if byte == b'"' || byte == b'\'' => quote = Some(byte),
            None => {
                let boundary = at == 0 || !is_ident(bytes[at - 1]);
                for keyword in ["if", "return"] {
                    let end = at + keyword.len();
                    if boundary
                        && bytes[at..].starts_with(keyword.as_bytes())
                        && bytes.get(end).is_none_or(|&next| !is_ident(next))
                    {
                        return Some((at, keyword));
                    }
                }
            }
        }
        at += 1;
    }
    None
}

fn is_ident(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$'
}

/// Splits `( inner ) tail` at the parenthesis matching the first one.
fn parenthesized(source: &str) -> Option<(&str, &str)> {
    let source = source.trim_start();
    if !source.starts_with('(') {
        return None;
    }
    let mut depth = 0usize;
    let mut quote = None;
    for (at, ch) in source.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Some((&source[1..at], &source[at + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

/// The leading string literal and what follows it.
fn string_literal(source: &str) -> Option<(&str, &str)> {
    let source = source.trim_start();
    let quote = source.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let close = source[1..].find(quote)?;
    Some((&source[1..1 + close], &source[close + 2..]))
}

fn strip_parens(source: &str) -> &str {
    match parenthesized(source) {
        Some((inner, tail)) if tail.trim().is_empty() => strip_parens(inner.trim()),
        _ => source,
    }
}

fn split_top_level<'a>(source: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (at, ch) in source.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, _) if depth == 0 && source[at..].starts_with(separator) && at >= start => {
                parts.push(&source[start..at]);
                start = at + separator.len();
            }
            _ => {}
        }
    }
    parts.push(&source[start..]);
    parts
}

/// Shell expression match: `*` is any run of characters, `?` exactly one.
fn shell_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack = None;
    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, from)) => {
                    p = star + 1;
                    t = from + 1;
                    backtrack = Some((star, from + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_values() {
        assert_eq!(ProxySpec::parse("system").unwrap(), ProxySpec::System);
        assert_eq!(ProxySpec::parse("none").unwrap(), ProxySpec::Direct);
        assert_eq!(
            ProxySpec::parse("manual:http://proxy.local:3128").unwrap(),
            ProxySpec::Manual(Url::parse("http://proxy.local:3128").unwrap())
        );
        assert!(matches!(
            ProxySpec::parse("pac:http://wpad/proxy.pac").unwrap(),
            ProxySpec::Automatic(_)
        ));
        assert!(ProxySpec::parse("bogus").is_err());
    }

    #[test]
    fn pac_script_selects_first_proxy() {
        let script = PacScript::parse(
            r#"function FindProxyForURL(url, host) { return "PROXY proxy.corp:8080; DIRECT"; }"#,
        );
        let target = Url::parse("https://server.example/api").unwrap();
        assert_eq!(
            script.proxy_for(&target),
            Some(Url::parse("http://proxy.corp:8080").unwrap())
        );
    }

    #[test]
    fn pac_script_direct_means_no_proxy() {
        let script = PacScript::parse(r#"function FindProxyForURL(u, h) { return "DIRECT"; }"#);
        let target = Url::parse("https://server.example/").unwrap();
        assert_eq!(script.proxy_for(&target), None);
    }

    const CORPORATE_PAC: &str = r#"
        function FindProxyForURL(url, host) {
            if (isPlainHostName(host) || dnsDomainIs(host, ".corp.local"))
                return "DIRECT";
            if (shExpMatch(host, "*.files.example") && !shExpMatch(url, "http:*")) {
                return 'PROXY files-proxy.corp:3128';
            }
            if (isInNet(dnsResolve(host), "10.0.0.0", "255.0.0.0"))
                return "DIRECT";
            return "PROXY proxy.corp:8080; DIRECT";
        }
    "#;

    fn proxy_for(script: &PacScript, target: &str) -> Option<String> {
        script
            .proxy_for(&Url::parse(target).unwrap())
            .map(|url| url.host_str().unwrap_or_default().to_string())
    }

    #[test]
    fn pac_script_evaluates_host_conditions() {
        let script = PacScript::parse(CORPORATE_PAC);
        assert_eq!(proxy_for(&script, "https://intranet/"), None);
        assert_eq!(proxy_for(&script, "https://drive.CORP.local/api"), None);
        assert_eq!(
            proxy_for(&script, "https://eu.files.example/api").as_deref(),
            Some("files-proxy.corp")
        );
        assert_eq!(
            proxy_for(&script, "http://eu.files.example/api").as_deref(),
            Some("proxy.corp")
        );
        // isInNet cannot be evaluated, so its rule is passed over.
        assert_eq!(
            proxy_for(&script, "https://10.1.2.3/").as_deref(),
            Some("proxy.corp")
        );
    }

    #[test]
    fn pac_script_without_a_matching_rule_goes_direct() {
        let script = PacScript::parse(
            r#"function FindProxyForURL(url, host) {
                if (localHostOrDomainIs(host, "www.example.org")) return "PROXY p.example:80";
            }"#,
        );
        assert_eq!(proxy_for(&script, "https://www/").as_deref(), Some("p.example"));
        assert_eq!(
            proxy_for(&script, "https://www.example.org/").as_deref(),
            Some("p.example")
        );
        assert_eq!(proxy_for(&script, "https://www.example.com/"), None);
    }

    #[test]
    fn shell_expressions_match_like_pac() {
        assert!(shell_match("*.example.*", "a.example.org"));
        assert!(shell_match("host?", "host1"));
        assert!(!shell_match("host?", "host12"));
        assert!(shell_match("*", ""));
        assert!(!shell_match("*.example", "example"));
    }
}
