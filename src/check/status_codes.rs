//! Accepted HTTP status-code patterns.

use std::fmt;

/// One entry of `accepted_status_codes`: `200`, `2**`, `20*` or `200-299`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusPattern {
    Exact(u16),
    /// Leading digits that must match; the rest are wildcards.
    Prefix { prefix: u16, wildcards: u32 },
    Range(u16, u16),
}

impl StatusPattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let s = raw.trim();

        if let Some((lo, hi)) = s.split_once('-') {
            let lo = parse_code(lo.trim(), raw)?;
            let hi = parse_code(hi.trim(), raw)?;
            if lo > hi {
                return Err(format!("range {} is reversed", raw));
            }
            return Ok(Self::Range(lo, hi));
        }

        if s.len() != 3 {
            return Err(format!("{:?} is not a three-digit status pattern", raw));
        }

        let stars = s.bytes().rev().take_while(|b| *b == b'*').count();
        if stars == 0 {
            return parse_code(s, raw).map(Self::Exact);
        }
        if stars == 3 {
            return Err(format!("{:?} needs at least one leading digit", raw));
        }

        let digits = &s[..3 - stars];
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("{:?} mixes digits and wildcards", raw));
        }
        let prefix: u16 = digits
            .parse()
            .map_err(|_| format!("{:?} is not a status pattern", raw))?;
        let wildcards = stars as u32;
        let low = prefix * 10u16.pow(wildcards);
        if !(100..=599).contains(&low) {
            return Err(format!("{:?} is outside 100-599", raw));
        }
        Ok(Self::Prefix { prefix, wildcards })
    }

    pub fn matches(&self, code: u16) -> bool {
        match *self {
            Self::Exact(c) => c == code,
            Self::Prefix { prefix, wildcards } => code / 10u16.pow(wildcards) == prefix && code < 1000,
            Self::Range(lo, hi) => (lo..=hi).contains(&code),
        }
    }
}

impl fmt::Display for StatusPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Exact(c) => write!(f, "{}", c),
            Self::Prefix { prefix, wildcards } => {
                write!(f, "{}{}", prefix, "*".repeat(wildcards as usize))
            }
            Self::Range(lo, hi) => write!(f, "{}-{}", lo, hi),
        }
    }
}

fn parse_code(s: &str, raw: &str) -> Result<u16, String> {
    let code: u16 = s
        .parse()
        .map_err(|_| format!("{:?} is not a status code", raw))?;
    if !(100..=599).contains(&code) {
        return Err(format!("{:?} is outside 100-599", raw));
    }
    Ok(code)
}

/// Parse a whole `accepted_status_codes` list.
pub fn parse_patterns(raw: &[String]) -> Result<Vec<StatusPattern>, String> {
    raw.iter().map(|s| StatusPattern::parse(s)).collect()
}

/// True when any pattern accepts `code`.
pub fn accepts(patterns: &[StatusPattern], code: u16) -> bool {
    patterns.iter().any(|p| p.matches(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_class() {
        let p = parse_patterns(&["2**".to_string()]).unwrap();
        for code in [200, 250, 299] {
            assert!(accepts(&p, code), "{} should be accepted", code);
        }
        for code in [301, 404] {
            assert!(!accepts(&p, code), "{} should be rejected", code);
        }
    }

    #[test]
    fn test_single_wildcard_and_range() {
        let p = StatusPattern::parse("20*").unwrap();
        assert!(p.matches(204));
        assert!(!p.matches(210));

        let r = StatusPattern::parse("200-299").unwrap();
        assert!(r.matches(200) && r.matches(299));
        assert!(!r.matches(300));
        assert_eq!(r.to_string(), "200-299");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "2", "***", "2*0", "700", "299-200", "abc", "6**"] {
            assert!(StatusPattern::parse(bad).is_err(), "{:?} should fail", bad);
        }
    }
}
